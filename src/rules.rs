//! Rule tables that steer identity resolution.
//!
//! Global tables (id fixes, excluded characters, special id remaps) apply to
//! every language; language tables hold name exclusions, search-index combine
//! rules and extra character exclusions. A missing rule file is an empty
//! table. Tables are loaded lazily through [`RuleCache`], which one pipeline
//! invocation owns and hands to every stage by reference.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::data_service::read_json_or_default;
use crate::error::PipelineResult;

const MAX_FIX_HOPS: usize = 8;

/// 历史遗留或格式错误的立绘 id
const BUILTIN_SPECIAL_IDS: &[(&str, &str)] = &[("ill_amiya_normal", "char_002_amiya_1")];

#[derive(Debug, Clone, Default)]
pub struct GlobalRules {
    pub character_fixes: BTreeMap<String, String>,
    pub excluded_characters: BTreeSet<String>,
    pub special_ids: BTreeMap<String, String>,
}

impl GlobalRules {
    pub fn with_builtin_special_ids(mut self) -> Self {
        for (from, to) in BUILTIN_SPECIAL_IDS {
            self.special_ids
                .entry(from.to_string())
                .or_insert_with(|| to.to_string());
        }
        self
    }

    /// Follows the fix chain (`a -> b -> c`) to its end.
    pub fn fix(&self, char_id: &str) -> String {
        let mut current = char_id;
        for _ in 0..MAX_FIX_HOPS {
            match self.character_fixes.get(current) {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        current.to_string()
    }

    pub fn special_id(&self, raw: &str) -> Option<&str> {
        self.special_ids.get(raw).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LanguageRules {
    /// name -> charIds that must never carry that name
    pub name_excludes: BTreeMap<String, Vec<String>>,
    /// charId -> charId the search index should point at instead
    pub combine_rules: BTreeMap<String, String>,
    pub excluded_characters: BTreeSet<String>,
}

impl LanguageRules {
    pub fn is_name_excluded(&self, name: &str, char_id: &str) -> bool {
        self.name_excludes
            .get(name)
            .map(|ids| ids.iter().any(|id| id == char_id))
            .unwrap_or(false)
    }

    pub fn combine<'a>(&'a self, char_id: &'a str) -> &'a str {
        self.combine_rules
            .get(char_id)
            .map(|s| s.as_str())
            .unwrap_or(char_id)
    }
}

fn lowercase_map(map: BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.into_iter()
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_lowercase()))
        .collect()
}

fn lowercase_set(set: BTreeSet<String>) -> BTreeSet<String> {
    set.into_iter().map(|s| s.trim().to_lowercase()).collect()
}

pub struct RuleCache {
    rules_dir: Option<PathBuf>,
    global: Mutex<Option<Arc<GlobalRules>>>,
    languages: Mutex<HashMap<String, Arc<LanguageRules>>>,
}

impl RuleCache {
    pub fn new(rules_dir: impl Into<PathBuf>) -> Self {
        Self {
            rules_dir: Some(rules_dir.into()),
            global: Mutex::new(None),
            languages: Mutex::new(HashMap::new()),
        }
    }

    /// Preloaded tables, no filesystem access. Unknown languages resolve to
    /// empty rules.
    pub fn with_tables(global: GlobalRules, languages: HashMap<String, LanguageRules>) -> Self {
        Self {
            rules_dir: None,
            global: Mutex::new(Some(Arc::new(global))),
            languages: Mutex::new(
                languages
                    .into_iter()
                    .map(|(lang, rules)| (lang, Arc::new(rules)))
                    .collect(),
            ),
        }
    }

    pub fn global(&self) -> PipelineResult<Arc<GlobalRules>> {
        let mut slot = self.global.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rules) = slot.as_ref() {
            return Ok(Arc::clone(rules));
        }

        let rules = match &self.rules_dir {
            Some(dir) => {
                let global_dir = dir.join("global");
                let character_fixes: BTreeMap<String, String> =
                    read_json_or_default(&global_dir.join("character_fixes.json"))?;
                let excluded_characters: BTreeSet<String> =
                    read_json_or_default(&global_dir.join("excluded_characters.json"))?;
                let special_ids: BTreeMap<String, String> =
                    read_json_or_default(&global_dir.join("special_ids.json"))?;
                GlobalRules {
                    character_fixes: lowercase_map(character_fixes),
                    excluded_characters: lowercase_set(excluded_characters),
                    special_ids: lowercase_map(special_ids),
                }
            }
            None => GlobalRules::default(),
        }
        .with_builtin_special_ids();

        log::debug!(
            "[RULES] global: {} fixes, {} exclusions, {} special ids",
            rules.character_fixes.len(),
            rules.excluded_characters.len(),
            rules.special_ids.len()
        );

        let rules = Arc::new(rules);
        *slot = Some(Arc::clone(&rules));
        Ok(rules)
    }

    pub fn language(&self, lang: &str) -> PipelineResult<Arc<LanguageRules>> {
        let mut cache = self.languages.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rules) = cache.get(lang) {
            return Ok(Arc::clone(rules));
        }

        let rules = match &self.rules_dir {
            Some(dir) => {
                let lang_dir = dir.join(lang);
                let name_excludes: BTreeMap<String, Vec<String>> =
                    read_json_or_default(&lang_dir.join("name_excludes.json"))?;
                let combine_rules: BTreeMap<String, String> =
                    read_json_or_default(&lang_dir.join("combine_rules.json"))?;
                let excluded_characters: BTreeSet<String> =
                    read_json_or_default(&lang_dir.join("excluded_characters.json"))?;
                LanguageRules {
                    name_excludes: name_excludes
                        .into_iter()
                        .map(|(name, ids)| {
                            (name, ids.into_iter().map(|id| id.to_lowercase()).collect())
                        })
                        .collect(),
                    combine_rules: lowercase_map(combine_rules),
                    excluded_characters: lowercase_set(excluded_characters),
                }
            }
            None => LanguageRules::default(),
        };

        log::debug!(
            "[RULES] {}: {} name exclusions, {} combine rules",
            lang,
            rules.name_excludes.len(),
            rules.combine_rules.len()
        );

        let rules = Arc::new(rules);
        cache.insert(lang.to_string(), Arc::clone(&rules));
        Ok(rules)
    }
}
