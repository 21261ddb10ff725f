use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharType {
    Operator,
    Npc,
}

impl CharType {
    /// 干员 id 以 `char_` 开头，其余一律视为 NPC
    pub fn from_char_id(char_id: &str) -> Self {
        if char_id.starts_with("char_") {
            CharType::Operator
        } else {
            CharType::Npc
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterRecord {
    #[serde(rename = "charId")]
    pub char_id: String,
    #[serde(rename = "validVariants")]
    pub valid_variants: Vec<String>,
    #[serde(rename = "charType")]
    pub char_type: CharType,
    #[serde(rename = "dialogCount", default)]
    pub dialog_count: usize,
}

impl CharacterRecord {
    pub fn new(char_id: &str) -> Self {
        Self {
            char_id: char_id.to_string(),
            valid_variants: Vec::new(),
            char_type: CharType::from_char_id(char_id),
            dialog_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameRecord {
    #[serde(rename = "speakerNames", default)]
    pub speaker_names: Vec<String>,
    #[serde(rename = "searchNames", default)]
    pub search_names: Vec<String>,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
}

/// 搜索索引的值：唯一角色或同名的多个角色
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchEntry {
    Single(String),
    Multiple(Vec<String>),
}

impl SearchEntry {
    pub fn contains(&self, char_id: &str) -> bool {
        match self {
            SearchEntry::Single(id) => id == char_id,
            SearchEntry::Multiple(ids) => ids.iter().any(|id| id == char_id),
        }
    }

    pub fn push(&mut self, char_id: &str) {
        if self.contains(char_id) {
            return;
        }
        match self {
            SearchEntry::Single(existing) => {
                *self = SearchEntry::Multiple(vec![existing.clone(), char_id.to_string()]);
            }
            SearchEntry::Multiple(ids) => ids.push(char_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEntry {
    #[serde(rename = "lastScanTime")]
    pub last_scan_time: i64,
    #[serde(rename = "variantCount")]
    pub variant_count: usize,
}

pub type CharacterTable = BTreeMap<String, CharacterRecord>;
pub type NameTable = BTreeMap<String, NameRecord>;
pub type StoryTable = BTreeMap<String, Vec<String>>;
pub type SearchIndex = BTreeMap<String, SearchEntry>;
pub type ScanState = BTreeMap<String, ScanEntry>;

/// 单个剧情文件（或合并后多个文件）中某个角色的解析结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    #[serde(rename = "charId")]
    pub char_id: String,
    #[serde(rename = "speakerNames")]
    pub speaker_names: BTreeSet<String>,
    #[serde(rename = "nameCounts")]
    pub name_counts: BTreeMap<String, usize>,
    #[serde(rename = "storyFiles")]
    pub story_files: BTreeSet<String>,
    pub variants: BTreeSet<String>,
    #[serde(rename = "dialogCount")]
    pub dialog_count: usize,
}

impl ParseResult {
    pub fn new(char_id: &str) -> Self {
        Self {
            char_id: char_id.to_string(),
            ..Default::default()
        }
    }

    /// 集合取并集、计数求和，因此合并顺序不影响结果
    pub fn absorb(&mut self, other: ParseResult) {
        self.speaker_names.extend(other.speaker_names);
        for (name, count) in other.name_counts {
            *self.name_counts.entry(name).or_insert(0) += count;
        }
        self.story_files.extend(other.story_files);
        self.variants.extend(other.variants);
        self.dialog_count += other.dialog_count;
    }

    /// 出现次数最多的名字，次数相同时取字典序最小者
    pub fn dominant_name(&self) -> Option<&str> {
        self.speaker_names
            .iter()
            .max_by(|a, b| {
                let ca = self.name_counts.get(*a).copied().unwrap_or(0);
                let cb = self.name_counts.get(*b).copied().unwrap_or(0);
                ca.cmp(&cb).then_with(|| b.cmp(a))
            })
            .map(|s| s.as_str())
    }
}

/// charId -> 解析结果
pub type ParseResults = BTreeMap<String, ParseResult>;

pub fn merge_parse_results(into: &mut ParseResults, from: ParseResults) {
    for (char_id, result) in from {
        match into.get_mut(&char_id) {
            Some(existing) => existing.absorb(result),
            None => {
                into.insert(char_id, result);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryReviewEntry {
    #[serde(rename = "storyTxt", default)]
    pub story_txt: Option<String>,
    #[serde(rename = "storySort", default)]
    pub story_sort: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryReviewActivity {
    #[serde(rename = "infoUnlockDatas", default)]
    pub info_unlock_datas: Vec<StoryReviewEntry>,
}

/// 持久化的全部表；一致性由整理阶段保证
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tables {
    pub characters: CharacterTable,
    pub names: NameTable,
    pub storys: StoryTable,
    pub search_index: SearchIndex,
    pub scan_state: ScanState,
}
