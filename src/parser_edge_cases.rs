use super::*;

fn parse_zh(content: &str) -> ParseResults {
    parse_story_cast(
        content,
        "activities/act1/level_act1_01",
        "zh_CN",
        &GlobalRules::default(),
        &LanguageRules::default(),
    )
}

#[test]
fn test_empty_file() {
    assert!(parse_zh("").is_empty());
    assert!(parse_zh("\n\n   \n").is_empty());
}

#[test]
fn test_malformed_tags() {
    // 不完整的标签
    let content = r#"[name="角色" 对话（缺少闭合引号和方括号
[Character(name="char_002_amiya"
下一行文本"#;
    let result = parse_zh(content);
    // 应该能够容错处理，不崩溃
    assert!(result.is_empty());
}

#[test]
fn test_empty_and_placeholder_actor_tokens() {
    let content = r#"[Character(name="char_empty",name2="")]
[name="阿米娅"]没有人在场。"#;
    let result = parse_zh(content);
    assert!(result.is_empty());
}

#[test]
fn test_byte_order_mark_and_crlf() {
    let content = "\u{feff}[Character(name=\"char_002_amiya#2\")]\r\n[name=\"阿米娅\"]博士。\r\n";
    let result = parse_zh(content);
    assert_eq!(
        result["char_002_amiya"]
            .speaker_names
            .iter()
            .collect::<Vec<_>>(),
        vec!["阿米娅"]
    );
    assert!(result["char_002_amiya"].variants.contains("char_002_amiya#2$1"));
}

#[test]
fn test_name_with_bracket_inside_quotes() {
    let content = r#"[Character(name="char_x")]
[name="[未知]"]括号名字。"#;
    let result = parse_zh(content);
    assert!(result["char_x"].speaker_names.contains("[未知]"));
}

#[test]
fn test_multiline_counts_as_name_event() {
    let content = r#"[Character(name="char_x")]
[multiline(name="陈")]第一行
[multiline(name="陈", end=true)]第二行"#;
    let result = parse_zh(content);
    assert_eq!(result["char_x"].name_counts["陈"], 2);
    assert_eq!(result["char_x"].dialog_count, 2);
}

#[test]
fn test_name_without_text_still_attributes() {
    let content = r#"[Character(name="char_x")]
[name="陈"]"#;
    let result = parse_zh(content);
    assert!(result["char_x"].speaker_names.contains("陈"));
}

#[test]
fn test_empty_name_does_not_claim_focus() {
    let content = r#"[Character(name="char_x")]
[name=""]……
[name="   "]……
[name="陈"]到了。"#;
    let result = parse_zh(content);
    assert_eq!(result["char_x"].speaker_names.iter().collect::<Vec<_>>(), vec!["陈"]);
    assert_eq!(result["char_x"].dialog_count, 1);
}

#[test]
fn test_whitespace_in_name_is_trimmed() {
    let content = r#"[Character(name="char_x")]
[name="  陈  "]你好。"#;
    let result = parse_zh(content);
    assert!(result["char_x"].speaker_names.contains("陈"));
}

#[test]
fn test_uppercase_commands() {
    let content = r#"[CHARACTER(NAME="CHAR_X#3", FOCUS=1)]
[NAME="陈"]大写命令。"#;
    let result = parse_zh(content);
    assert!(result["char_x"].speaker_names.contains("陈"));
    assert!(result["char_x"].variants.contains("char_x#3$1"));
}

#[test]
fn test_focus_on_empty_slot_drops_name() {
    let content = r#"[Character(name="char_x", focus=3)]
[name="陈"]三号位没人。"#;
    let result = parse_zh(content);
    assert!(result["char_x"].speaker_names.is_empty());
}

#[test]
fn test_third_slot_in_character_command() {
    let content = r#"[Character(name="char_a", name2="char_b", name3="char_c", focus=3)]
[name="丙"]我在三号位。"#;
    let result = parse_zh(content);
    assert_eq!(result.len(), 3);
    assert!(result["char_c"].speaker_names.contains("丙"));
}

#[test]
fn test_established_name_survives_dialog_reset() {
    let content = r#"[Character(name="char_x")]
[name="陈"]第一句。
[Dialog]
[Character(name="char_y", name2="char_x", focus=1)]
[name="陈"]还是我。"#;
    let result = parse_zh(content);
    assert_eq!(result["char_x"].name_counts["陈"], 2);
    assert!(result["char_y"].speaker_names.is_empty());
}

#[test]
fn test_charslot_without_arguments_clears_stage() {
    let content = r#"[charslot(slot="m", name="char_x")]
[charslot]
[name="陈"]没人。"#;
    let result = parse_zh(content);
    assert!(result["char_x"].speaker_names.is_empty());
}

#[test]
fn test_charslot_with_placeholder_vacates_slot() {
    let content = r#"[charslot(slot="l", name="char_x")]
[charslot(slot="l", name="char_empty")]
[name="陈"]左边空了。"#;
    let result = parse_zh(content);
    assert!(result["char_x"].speaker_names.is_empty());
}

#[test]
fn test_global_fix_applies_inside_parser() {
    let mut global = GlobalRules::default();
    global
        .character_fixes
        .insert("char_old".to_string(), "char_new".to_string());
    let content = r#"[Character(name="char_old#2")]
[name="新名字"]改名了。"#;
    let result = parse_story_cast(content, "s", "zh_CN", &global, &LanguageRules::default());
    assert!(!result.contains_key("char_old"));
    assert!(result["char_new"].variants.contains("char_new#2$1"));
}

#[test]
fn test_very_long_script() {
    let mut content = String::from("[Character(name=\"char_x\")]\n");
    for _ in 0..5000 {
        content.push_str("[name=\"陈\"]这是一段非常长的对话。\n");
    }
    let result = parse_zh(&content);
    assert_eq!(result["char_x"].dialog_count, 5000);
}
