use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::DataSource;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{StoryReviewActivity, Tables};

const GAME_SLUG: &str = "arknights";
const GLOBAL_DIR: &str = "global";
const CHARACTERS_FILE: &str = "characters.json";
const SCAN_STATE_FILE: &str = "scan_state.json";
const NAMES_FILE: &str = "names.json";
const STORYS_FILE: &str = "storys.json";
const SEARCH_INDEX_FILE: &str = "search_index.json";

/// 剧情脚本文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryFile {
    /// relative path without `.txt`, forward slashes
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub written: usize,
    pub unchanged: usize,
}

/// Reads a JSON file, treating a missing file as `T::default()`.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> PipelineResult<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(err) => return Err(PipelineError::io(path, err)),
    };
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&content).map_err(|e| PipelineError::json(path.display().to_string(), e))
}

/// 已写入临时文件、尚未替换目标的输出
#[derive(Debug)]
pub struct StagedWrite {
    path: PathBuf,
    temp_path: PathBuf,
    digest: String,
}

impl StagedWrite {
    pub fn commit(self) -> PipelineResult<()> {
        fs::rename(&self.temp_path, &self.path).map_err(|e| PipelineError::io(&self.path, e))?;
        log::debug!("[SYNC] wrote {} ({})", self.path.display(), &self.digest[..12]);
        Ok(())
    }

    pub fn discard(self) {
        let _ = fs::remove_file(&self.temp_path);
    }
}

/// Serializes `value` into `<path>.tmp`; [`StagedWrite::commit`] renames it
/// over the target. Returns `None` when the file already holds identical
/// bytes.
pub fn stage_json<T: Serialize>(path: &Path, value: &T) -> PipelineResult<Option<StagedWrite>> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| PipelineError::json(path.display().to_string(), e))?;
    let digest = Sha256::digest(content.as_bytes());

    if let Ok(existing) = fs::read(path) {
        if Sha256::digest(&existing) == digest {
            log::debug!("[SYNC] {} unchanged", path.display());
            return Ok(None);
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }
    let temp_path = path.with_extension("json.tmp");
    if let Err(err) = fs::write(&temp_path, content.as_bytes()) {
        let _ = fs::remove_file(&temp_path);
        return Err(PipelineError::io(&temp_path, err));
    }

    Ok(Some(StagedWrite {
        path: path.to_path_buf(),
        temp_path,
        digest: hex::encode(digest),
    }))
}

/// `activities/act1/level_act1_01.txt` -> `activities/act1/level_act1_01`
pub fn story_id_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let text = relative.to_string_lossy().replace('\\', "/");
    let id = text.strip_suffix(".txt")?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

fn is_summary_dir(story_id: &str) -> bool {
    let first = story_id.split('/').next().unwrap_or("");
    first == "info" || first == "[uc]info"
}

/// story_review_table 里所有 `storyTxt`，统一为小写路径
pub fn parse_story_review_table(content: &str) -> PipelineResult<BTreeSet<String>> {
    let data: HashMap<String, Value> = serde_json::from_str(content)
        .map_err(|e| PipelineError::json("story review table", e))?;

    let mut allowlist = BTreeSet::new();
    for (act_id, value) in data {
        let activity: StoryReviewActivity = match serde_json::from_value(value) {
            Ok(activity) => activity,
            Err(err) => {
                log::debug!("[SYNC] skipping review entry {}: {}", act_id, err);
                continue;
            }
        };
        for entry in activity.info_unlock_datas {
            if let Some(story_txt) = entry.story_txt {
                let normalized = normalize_story_path(&story_txt);
                if !normalized.is_empty() {
                    allowlist.insert(normalized);
                }
            }
        }
    }
    Ok(allowlist)
}

pub fn normalize_story_path(raw: &str) -> String {
    raw.trim()
        .replace('\\', "/")
        .trim_matches('/')
        .to_lowercase()
}

/// A story path is allowed when it is listed, or lives inside a listed
/// directory (monthly chat style entries point at a folder).
pub fn is_story_allowed(allowlist: &BTreeSet<String>, story_id: &str) -> bool {
    let normalized = normalize_story_path(story_id);
    if allowlist.contains(&normalized) {
        return true;
    }
    let mut prefix = normalized.as_str();
    while let Some(pos) = prefix.rfind('/') {
        prefix = &prefix[..pos];
        if allowlist.contains(prefix) {
            return true;
        }
    }
    false
}

#[derive(Clone)]
pub struct DataService {
    data_dir: PathBuf,
    output_dir: PathBuf,
}

impl DataService {
    pub fn new(data_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn story_dir(&self, lang: &str) -> PathBuf {
        self.data_dir.join(lang).join("gamedata/story")
    }

    pub fn is_installed(&self, lang: &str) -> bool {
        self.story_dir(lang).is_dir()
    }

    fn global_output(&self, file: &str) -> PathBuf {
        self.output_dir.join(GLOBAL_DIR).join(GAME_SLUG).join(file)
    }

    fn language_output(&self, lang: &str, file: &str) -> PathBuf {
        self.output_dir.join(lang).join(GAME_SLUG).join(file)
    }

    /// 列出某语言下的全部剧情脚本，按 id 排序
    pub fn list_story_files(&self, lang: &str) -> PipelineResult<Vec<StoryFile>> {
        let root = self.story_dir(lang);
        if !root.is_dir() {
            return Err(PipelineError::Config(format!(
                "story directory not found: {}",
                root.display()
            )));
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&root).follow_links(true) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                PipelineError::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(id) = story_id_for(&root, entry.path()) else {
                continue;
            };
            if is_summary_dir(&id) {
                continue;
            }
            files.push(StoryFile {
                id,
                path: entry.path().to_path_buf(),
            });
        }

        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }

    pub fn read_story_text(path: &Path) -> PipelineResult<String> {
        let bytes = fs::read(path).map_err(|e| PipelineError::io(path, e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn load_tables(&self, lang: &str) -> PipelineResult<Tables> {
        Ok(Tables {
            characters: read_json_or_default(&self.global_output(CHARACTERS_FILE))?,
            scan_state: read_json_or_default(&self.global_output(SCAN_STATE_FILE))?,
            names: read_json_or_default(&self.language_output(lang, NAMES_FILE))?,
            storys: read_json_or_default(&self.language_output(lang, STORYS_FILE))?,
            search_index: read_json_or_default(&self.language_output(lang, SEARCH_INDEX_FILE))?,
        })
    }

    /// 五个文件全部写好临时文件后才逐个替换；任何一个失败则一个都不替换
    pub fn save_tables(&self, lang: &str, tables: &Tables) -> PipelineResult<WriteSummary> {
        let mut staged = Vec::with_capacity(5);
        let mut unchanged = 0;
        let results = [
            stage_json(&self.global_output(CHARACTERS_FILE), &tables.characters),
            stage_json(&self.global_output(SCAN_STATE_FILE), &tables.scan_state),
            stage_json(&self.language_output(lang, NAMES_FILE), &tables.names),
            stage_json(&self.language_output(lang, STORYS_FILE), &tables.storys),
            stage_json(
                &self.language_output(lang, SEARCH_INDEX_FILE),
                &tables.search_index,
            ),
        ];

        let mut failure = None;
        for result in results {
            match result {
                Ok(Some(write)) => staged.push(write),
                Ok(None) => unchanged += 1,
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        if let Some(err) = failure {
            staged.into_iter().for_each(StagedWrite::discard);
            return Err(err);
        }

        let written = staged.len();
        for write in staged {
            write.commit()?;
        }
        Ok(WriteSummary { written, unchanged })
    }

    fn create_http_client(timeout: Duration) -> PipelineResult<Client> {
        Client::builder()
            .user_agent("story-cast")
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Http {
                url: String::new(),
                message: format!("Failed to create http client: {}", e),
            })
    }

    /// 获取权威剧情路径列表
    pub fn fetch_story_allowlist(
        &self,
        source: &DataSource,
        timeout: Duration,
    ) -> PipelineResult<BTreeSet<String>> {
        let content = match source {
            DataSource::Local(path) => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    self.data_dir.join(path)
                };
                fs::read_to_string(&path).map_err(|e| PipelineError::io(&path, e))?
            }
            DataSource::Remote(url) => {
                let client = Self::create_http_client(timeout)?;
                let response = client.get(url).send().map_err(|e| PipelineError::Http {
                    url: url.clone(),
                    message: e.to_string(),
                })?;
                if !response.status().is_success() {
                    return Err(PipelineError::Http {
                        url: url.clone(),
                        message: format!("status {}", response.status()),
                    });
                }
                response.text().map_err(|e| PipelineError::Http {
                    url: url.clone(),
                    message: e.to_string(),
                })?
            }
        };
        parse_story_review_table(&content)
    }
}
