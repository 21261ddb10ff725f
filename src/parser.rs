use crate::models::{ParseResult, ParseResults};
use crate::name_filter::is_meaningless;
use crate::normalizer::{normalize, CanonicalVariant};
use crate::rules::{GlobalRules, LanguageRules};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[cfg(test)]
#[path = "parser_edge_cases.rs"]
mod parser_edge_cases;

lazy_static! {
    static ref ATTR_RE: Regex =
        Regex::new(r#"(?i)([a-z0-9_]+)\s*=\s*(?:"([^"]*)"|([^,\s\)\]"]+))"#)
            .expect("invalid attribute regex");
    static ref NAME_SLOT_RE: Regex = Regex::new(r"^name(\d*)$").expect("invalid slot regex");
}

const FOCUS_ALL: i32 = 99;
const FOCUS_NONE: i32 = -1;
const PRIMARY_SLOT: i32 = 1;

/// 舞台状态：当前在场角色、焦点以及本文件内已确认的名字
#[derive(Debug)]
struct Stage {
    /// slot key (`name`, `name2`, ...) -> occupant
    characters: BTreeMap<String, CanonicalVariant>,
    speaker: i32,
    history: Vec<String>,
    names: HashMap<String, BTreeMap<String, usize>>,
    variants: HashMap<String, BTreeSet<String>>,
}

impl Stage {
    fn new() -> Self {
        Self {
            characters: BTreeMap::new(),
            speaker: FOCUS_NONE,
            history: Vec::new(),
            names: HashMap::new(),
            variants: HashMap::new(),
        }
    }

    fn clear(&mut self) {
        self.characters.clear();
        self.speaker = FOCUS_NONE;
    }

    fn install(&mut self, slot: String, variant: CanonicalVariant) {
        if !self.history.contains(&variant.base_id) {
            self.history.push(variant.base_id.clone());
        }
        self.variants
            .entry(variant.base_id.clone())
            .or_default()
            .insert(variant.to_string());
        self.characters.insert(slot, variant);
    }

    fn has_name(&self, base_id: &str, name: &str) -> bool {
        self.names
            .get(base_id)
            .map(|names| names.contains_key(name))
            .unwrap_or(false)
    }

    fn has_any_name(&self, base_id: &str) -> bool {
        self.names
            .get(base_id)
            .map(|names| !names.is_empty())
            .unwrap_or(false)
    }

    fn focused_character(&self) -> Option<&str> {
        if self.speaker == FOCUS_ALL || self.speaker <= 0 {
            return None;
        }
        self.characters
            .get(&slot_key(self.speaker))
            .map(|v| v.base_id.as_str())
    }

    /// 名字归属：已确认的名字优先，其次是尚无名字的焦点角色，否则丢弃。
    fn attribute(&mut self, name: &str, rules: &LanguageRules) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }

        let established = self
            .characters
            .values()
            .find(|v| self.has_name(&v.base_id, name))
            .map(|v| v.base_id.clone());

        let target = match established {
            Some(id) => id,
            None => match self.focused_character() {
                Some(id) if !self.has_any_name(id) => id.to_string(),
                _ => return,
            },
        };

        if rules.is_name_excluded(name, &target) {
            return;
        }

        *self
            .names
            .entry(target)
            .or_default()
            .entry(name.to_string())
            .or_insert(0) += 1;
    }

    fn into_results(self, story_id: &str, lang: &str) -> ParseResults {
        let mut results = ParseResults::new();
        for base_id in &self.history {
            let mut result = ParseResult::new(base_id);
            if let Some(names) = self.names.get(base_id) {
                for (name, count) in names {
                    if is_meaningless(name, lang) {
                        continue;
                    }
                    result.speaker_names.insert(name.clone());
                    result.name_counts.insert(name.clone(), *count);
                    result.dialog_count += count;
                }
            }
            if let Some(variants) = self.variants.get(base_id) {
                result.variants = variants.clone();
            }
            result.story_files.insert(story_id.to_string());
            results.insert(base_id.clone(), result);
        }
        results
    }
}

fn slot_key(index: i32) -> String {
    if index == PRIMARY_SLOT {
        "name".to_string()
    } else {
        format!("name{}", index)
    }
}

fn slot_index(raw: &str) -> Option<i32> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "l" | "left" => Some(1),
        "m" | "middle" => Some(2),
        "r" | "right" => Some(3),
        _ => None,
    }
}

fn parse_focus(raw: &str) -> Option<i32> {
    let value = raw.trim().to_ascii_lowercase();
    match value.as_str() {
        "all" => Some(FOCUS_ALL),
        "none" => Some(FOCUS_NONE),
        _ => slot_index(&value).or_else(|| value.parse::<i32>().ok()),
    }
}

/// 解析一个剧本文件，返回 `baseId -> 解析结果`。
///
/// Every character that ever occupies a slot gets an entry, even without an
/// attributed name, so the story association survives. Never fails: unknown
/// commands are ignored and malformed actor tokens simply attribute nothing.
pub fn parse_story_cast(
    content: &str,
    story_id: &str,
    lang: &str,
    global: &GlobalRules,
    rules: &LanguageRules,
) -> ParseResults {
    let mut stage = Stage::new();

    for raw_line in content.lines() {
        let line = raw_line.trim().trim_start_matches('\u{feff}').trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }

        if line.starts_with('[') {
            apply_command_line(&mut stage, line, global, rules);
        }
    }

    stage.into_results(story_id, lang)
}

/// 一行可以连写多个命令，例如 `[Character(...)][name="X"]台词`；
/// 遇到非 `[` 开头的正文即停止。
fn apply_command_line(stage: &mut Stage, line: &str, global: &GlobalRules, rules: &LanguageRules) {
    let mut rest = line;
    while rest.starts_with('[') {
        let Some(end) = command_end(rest) else {
            return;
        };
        apply_command(stage, &rest[1..end], global, rules);
        rest = rest[end + 1..].trim_start();
    }
}

fn apply_command(stage: &mut Stage, inside: &str, global: &GlobalRules, rules: &LanguageRules) {
    let (command, _) = split_command_and_attrs(inside);
    let command = command.to_ascii_lowercase();
    let attrs = parse_attributes(inside);

    match command.as_str() {
        "character" => apply_character(stage, &attrs, global, rules),
        "charslot" => apply_charslot(stage, &attrs, global, rules),
        "dialog" => stage.clear(),
        "name" | "multiline" => {
            if let Some(name) = attrs.get("name") {
                stage.attribute(name, rules);
            }
        }
        _ => {}
    }
}

fn apply_character(
    stage: &mut Stage,
    attrs: &HashMap<String, String>,
    global: &GlobalRules,
    rules: &LanguageRules,
) {
    let mut slots: Vec<(i32, &String)> = attrs
        .iter()
        .filter_map(|(key, value)| {
            let caps = NAME_SLOT_RE.captures(key)?;
            let index = match caps.get(1).map(|m| m.as_str()) {
                Some("") | None => PRIMARY_SLOT,
                Some(digits) => digits.parse().ok()?,
            };
            Some((index, value))
        })
        .collect();

    stage.clear();
    if slots.is_empty() {
        return;
    }
    slots.sort_by_key(|(index, _)| *index);

    for (index, raw) in slots {
        if let Some(variant) = normalize(raw, global, rules) {
            stage.install(slot_key(index), variant);
        }
    }

    stage.speaker = attrs
        .get("focus")
        .and_then(|f| parse_focus(f))
        .unwrap_or(PRIMARY_SLOT);
}

fn apply_charslot(
    stage: &mut Stage,
    attrs: &HashMap<String, String>,
    global: &GlobalRules,
    rules: &LanguageRules,
) {
    if attrs.is_empty() {
        stage.clear();
        return;
    }

    let slot = attrs.get("slot").and_then(|s| slot_index(s));
    let focus = attrs.get("focus").and_then(|f| parse_focus(f));

    if let Some(raw) = attrs.get("name") {
        let index = slot.unwrap_or(PRIMARY_SLOT);
        match normalize(raw, global, rules) {
            Some(variant) => {
                stage
                    .characters
                    .retain(|_, occupant| occupant.base_id != variant.base_id);
                stage.install(slot_key(index), variant);
            }
            None => {
                stage.characters.remove(&slot_key(index));
            }
        }
        stage.speaker = focus.or(slot).unwrap_or(PRIMARY_SLOT);
        return;
    }

    if let Some(index) = slot {
        stage.characters.remove(&slot_key(index));
    }
    if let Some(focus) = focus {
        stage.speaker = focus;
    }
}

/// 找到命令的右方括号，忽略引号内的 `]`
fn command_end(line: &str) -> Option<usize> {
    let mut in_quotes = false;
    for (idx, ch) in line.char_indices().skip(1) {
        match ch {
            '"' => in_quotes = !in_quotes,
            ']' if !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}

fn split_command_and_attrs(inside: &str) -> (String, Option<&str>) {
    let inside = inside.trim();
    if inside.is_empty() {
        return (String::new(), None);
    }

    let mut end_idx = inside.len();
    for (idx, ch) in inside.char_indices() {
        if ch == '(' || ch == ' ' || ch == '=' {
            end_idx = idx;
            break;
        }
    }

    let command = inside[..end_idx].to_string();
    let attrs = if end_idx < inside.len() {
        Some(inside[end_idx..].trim())
    } else {
        None
    };

    (command, attrs)
}

fn parse_attributes(source: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    for caps in ATTR_RE.captures_iter(source) {
        let Some(key) = caps.get(1) else {
            continue;
        };
        if let Some(value) = caps.get(2).or_else(|| caps.get(3)) {
            attrs.insert(
                key.as_str().to_ascii_lowercase(),
                value.as_str().to_string(),
            );
        }
    }
    attrs
}
