use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

lazy_static! {
    static ref FILTERED_NAMES: HashSet<&'static str> = [
        "middle", "left", "right", "???", "？？？", "...", "……", "所有人", "all",
    ]
    .into_iter()
    .collect();
    static ref COMMON_STOPWORDS: HashSet<&'static str> =
        ["prts", "system", "narrator", "null", "none", "unknown", "{@nickname}"]
            .into_iter()
            .collect();
    static ref RAW_ID_RE: Regex =
        Regex::new(r"^(avg|char)_[a-z0-9]+_\d+(_\d+)?$").expect("invalid raw id regex");
    static ref RAW_ID_SUFFIX_RE: Regex =
        Regex::new(r"^(avg|char)_[a-z0-9]+_\d+(_\d+)?_[a-z]+$").expect("invalid raw id regex");
}

fn language_stopwords(lang: &str) -> &'static [&'static str] {
    match lang {
        "zh_CN" => &["旁白", "众人", "大家", "系统", "未知", "博士", "提示"],
        "zh_TW" => &["旁白", "眾人", "大家", "系統", "未知", "博士", "提示"],
        "en_US" => &["everyone", "all", "narration", "doctor", "dr.", "hint"],
        "ja_JP" => &["ナレーション", "全員", "みんな", "ドクター", "システム", "ヒント"],
        "ko_KR" => &["나레이션", "모두", "전원", "박사", "시스템", "힌트"],
        _ => &[],
    }
}

/// 判断对话框名字是否没有意义（占位符、数字、泄漏的角色 id、停用词）。
///
/// Pure: the same `(name, lang)` always yields the same answer.
pub fn is_meaningless(name: &str, lang: &str) -> bool {
    let normalized: String = name.nfkc().collect();
    let trimmed = normalized.trim();
    if trimmed.is_empty() {
        return true;
    }

    let lower = trimmed.to_lowercase();
    if FILTERED_NAMES.contains(trimmed) || FILTERED_NAMES.contains(lower.as_str()) {
        return true;
    }

    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }

    if RAW_ID_RE.is_match(&lower) || RAW_ID_SUFFIX_RE.is_match(&lower) {
        return true;
    }

    if COMMON_STOPWORDS.contains(lower.as_str()) {
        return true;
    }

    language_stopwords(lang)
        .iter()
        .any(|word| *word == trimmed || *word == lower)
}
