use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::variants::{DEFAULT_IMAGE_WORKERS, DEFAULT_MAX_SCANS};

const DEFAULT_STORY_REVIEW_URL: &str =
    "https://raw.githubusercontent.com/Kengxxiao/ArknightsGameData/master/{lang}/gamedata/excel/story_review_table.json";
const DEFAULT_MASTER_LANGUAGE: &str = "zh_CN";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// 外部数据源的写法：字符串，或 `{ "url": ... }` / `{ "path": ... }`。
/// `{lang}` is substituted when resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceRef {
    Plain(String),
    Remote { url: String },
    Local { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Local(PathBuf),
    Remote(String),
}

impl SourceRef {
    pub fn resolve(&self, lang: &str) -> DataSource {
        match self {
            SourceRef::Plain(value) => {
                let value = value.replace("{lang}", lang);
                if value.starts_with("http://") || value.starts_with("https://") {
                    DataSource::Remote(value)
                } else {
                    DataSource::Local(PathBuf::from(value))
                }
            }
            SourceRef::Remote { url } => DataSource::Remote(url.replace("{lang}", lang)),
            SourceRef::Local { path } => DataSource::Local(PathBuf::from(path.replace("{lang}", lang))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    #[serde(rename = "dataDir")]
    pub data_dir: PathBuf,
    #[serde(rename = "outputDir")]
    pub output_dir: PathBuf,
    #[serde(rename = "rulesDir")]
    pub rules_dir: PathBuf,
    pub languages: Vec<String>,
    #[serde(rename = "masterLanguage")]
    pub master_language: String,
    pub workers: usize,
    #[serde(rename = "checkImages")]
    pub check_images: bool,
    #[serde(rename = "forceScan")]
    pub force_scan: bool,
    #[serde(rename = "maxScans")]
    pub max_scans: usize,
    #[serde(rename = "imageWorkers")]
    pub image_workers: usize,
    #[serde(rename = "imageUrlTemplate")]
    pub image_url_template: Option<String>,
    #[serde(rename = "storyReview")]
    pub story_review: SourceRef,
    #[serde(rename = "httpTimeoutSecs")]
    pub http_timeout_secs: u64,
    #[serde(rename = "dryRun")]
    pub dry_run: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("ArknightsGameData"),
            output_dir: PathBuf::from("data"),
            rules_dir: PathBuf::from("rules"),
            languages: ["zh_CN", "en_US", "ja_JP", "ko_KR"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            master_language: DEFAULT_MASTER_LANGUAGE.to_string(),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            check_images: false,
            force_scan: false,
            max_scans: DEFAULT_MAX_SCANS,
            image_workers: DEFAULT_IMAGE_WORKERS,
            image_url_template: None,
            story_review: SourceRef::Plain(DEFAULT_STORY_REVIEW_URL.to_string()),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            dry_run: false,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| PipelineError::json(path.display().to_string(), e))
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.languages.is_empty() {
            return Err(PipelineError::Config("no languages configured".to_string()));
        }
        if self.workers == 0 {
            return Err(PipelineError::Config("workers must be at least 1".to_string()));
        }
        if self.master_language.trim().is_empty() {
            return Err(PipelineError::Config("master language is empty".to_string()));
        }
        Ok(())
    }

    /// 主语言总是最先处理，其余按配置顺序
    pub fn ordered_languages(&self) -> Vec<String> {
        let mut ordered = Vec::with_capacity(self.languages.len());
        if self.languages.contains(&self.master_language) {
            ordered.push(self.master_language.clone());
        }
        for lang in &self.languages {
            if !ordered.contains(lang) {
                ordered.push(lang.clone());
            }
        }
        ordered
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}
