use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

use crate::rules::{GlobalRules, LanguageRules};

const EMPTY_SLOT: &str = "char_empty";
const DEFAULT_FACE: &str = "1";
const DEFAULT_BODY: &str = "1";

lazy_static! {
    static ref TOKEN_RE: Regex = Regex::new(r"^([^#$]+)(?:#([^#$]*))?(?:#([^#$]*))?(?:\$([^#$]*))?")
        .expect("invalid actor token regex");
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").expect("invalid whitespace regex");
}

/// `baseId#face$body`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalVariant {
    pub base_id: String,
    pub face: String,
    pub body: String,
}

impl fmt::Display for CanonicalVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}${}", self.base_id, self.face, self.body)
    }
}

pub fn default_variant(char_id: &str) -> String {
    format!("{}#{}${}", char_id, DEFAULT_FACE, DEFAULT_BODY)
}

/// Base id of a canonical variant string (`char_002_amiya#1$1` -> `char_002_amiya`).
pub fn base_of(variant: &str) -> &str {
    variant.split(['#', '$']).next().unwrap_or(variant)
}

fn segment(raw: Option<regex::Match<'_>>) -> Option<String> {
    raw.map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// 把剧本中的角色标记规范化为 `(baseId, face, body)`。
///
/// Malformed, empty, placeholder and excluded tokens yield `None`; callers
/// treat that as "no attributable speaker".
pub fn normalize(
    raw: &str,
    global: &GlobalRules,
    lang: &LanguageRules,
) -> Option<CanonicalVariant> {
    let token = raw.trim().trim_matches('"').trim().to_lowercase();
    if token.is_empty() || token == EMPTY_SLOT {
        return None;
    }

    let caps = TOKEN_RE.captures(&token)?;
    let base_raw = caps.get(1)?.as_str().trim();
    if base_raw.is_empty() {
        return None;
    }
    let mut base_id = WHITESPACE_RE.replace_all(base_raw, "_").to_string();
    if base_id == EMPTY_SLOT {
        return None;
    }

    if let Some(remapped) = global.special_id(&base_id) {
        base_id = remapped.to_string();
    }
    base_id = global.fix(&base_id);

    if global.excluded_characters.contains(&base_id)
        || lang.excluded_characters.contains(&base_id)
    {
        return None;
    }

    let face = segment(caps.get(3))
        .or_else(|| segment(caps.get(2)))
        .unwrap_or_else(|| DEFAULT_FACE.to_string());
    let body = segment(caps.get(4)).unwrap_or_else(|| DEFAULT_BODY.to_string());

    Some(CanonicalVariant {
        base_id,
        face,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> Option<String> {
        normalize(raw, &GlobalRules::default(), &LanguageRules::default()).map(|v| v.to_string())
    }

    #[test]
    fn case_and_stray_whitespace_are_stable() {
        assert_eq!(norm("CHAR_002_AMIYA#5").as_deref(), Some("char_002_amiya#5$1"));
        assert_eq!(norm("char_002_amiya #5").as_deref(), Some("char_002_amiya#5$1"));
        assert_eq!(norm("char_002 amiya#5").as_deref(), Some("char_002_amiya#5$1"));
    }

    #[test]
    fn defaults_and_overrides() {
        assert_eq!(norm("char_002_amiya").as_deref(), Some("char_002_amiya#1$1"));
        assert_eq!(norm("char_002_amiya$2").as_deref(), Some("char_002_amiya#1$2"));
        assert_eq!(norm("char_002_amiya#5#2").as_deref(), Some("char_002_amiya#2$1"));
        assert_eq!(norm("char_002_amiya#5$3").as_deref(), Some("char_002_amiya#5$3"));
        assert_eq!(norm("\"char_002_amiya#5\"").as_deref(), Some("char_002_amiya#5$1"));
    }

    #[test]
    fn rejects_empty_and_placeholders() {
        assert_eq!(norm(""), None);
        assert_eq!(norm("   "), None);
        assert_eq!(norm("char_empty"), None);
        assert_eq!(norm("CHAR_EMPTY#1"), None);
        assert_eq!(norm("#5"), None);
        assert_eq!(norm("$2"), None);
    }

    #[test]
    fn applies_special_ids_fixes_and_exclusions() {
        let mut global = GlobalRules::default().with_builtin_special_ids();
        global
            .character_fixes
            .insert("char_002_amiya_1".to_string(), "char_002_amiya".to_string());
        global
            .excluded_characters
            .insert("char_bad_dup".to_string());
        let mut lang = LanguageRules::default();
        lang.excluded_characters.insert("npc_lang_only".to_string());

        let amiya = normalize("ill_amiya_normal#3", &global, &lang).unwrap();
        assert_eq!(amiya.base_id, "char_002_amiya");
        assert_eq!(amiya.to_string(), "char_002_amiya#3$1");

        assert!(normalize("char_bad_dup#1", &global, &lang).is_none());
        assert!(normalize("npc_lang_only", &global, &lang).is_none());
        assert!(normalize("npc_lang_only", &global, &LanguageRules::default()).is_some());
    }

    #[test]
    fn base_of_strips_suffixes() {
        assert_eq!(base_of("char_002_amiya#1$1"), "char_002_amiya");
        assert_eq!(base_of("char_002_amiya$2"), "char_002_amiya");
        assert_eq!(base_of("char_002_amiya"), "char_002_amiya");
        assert_eq!(default_variant("npc_001"), "npc_001#1$1");
    }
}
