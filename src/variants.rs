use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{CharacterTable, ParseResults, ScanEntry, ScanState};
use crate::normalizer::{base_of, default_variant};
use crate::pool::{partition, run_chunks};

pub const DEFAULT_IMAGE_WORKERS: usize = 6;
pub const DEFAULT_MAX_SCANS: usize = 300;
const RESCAN_INTERVAL_MS: i64 = 24 * 60 * 60 * 1000;

/// 立绘是否存在的外部判定
pub trait AssetProbe: Sync {
    fn exists(&self, variant: &str) -> PipelineResult<bool>;
}

/// `HEAD` against a URL template. `{variant}` is replaced with the
/// url-encoded variant string and `{charId}` with its base id.
pub struct HttpAssetProbe {
    client: Client,
    url_template: String,
}

impl HttpAssetProbe {
    pub fn new(url_template: &str, timeout: Duration) -> PipelineResult<Self> {
        let client = Client::builder()
            .user_agent("story-cast")
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Http {
                url: url_template.to_string(),
                message: format!("Failed to create http client: {}", e),
            })?;
        Ok(Self {
            client,
            url_template: url_template.to_string(),
        })
    }

    fn url_for(&self, variant: &str) -> String {
        self.url_template
            .replace("{variant}", &urlencoding::encode(variant))
            .replace("{charId}", base_of(variant))
    }
}

impl AssetProbe for HttpAssetProbe {
    fn exists(&self, variant: &str) -> PipelineResult<bool> {
        let url = self.url_for(variant);
        let response = self
            .client
            .head(&url)
            .send()
            .map_err(|e| PipelineError::Http {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
            Ok(false)
        } else {
            Err(PipelineError::Http {
                url,
                message: format!("unexpected status {}", status),
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct VariantOptions {
    pub check_images: bool,
    pub force: bool,
    pub max_scans: usize,
    pub workers: usize,
    /// unix millis
    pub now: i64,
}

impl Default for VariantOptions {
    fn default() -> Self {
        Self {
            check_images: false,
            force: false,
            max_scans: DEFAULT_MAX_SCANS,
            workers: DEFAULT_IMAGE_WORKERS,
            now: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantPlan {
    /// charId -> variants for this pass
    pub variants: BTreeMap<String, Vec<String>>,
    /// characters whose list was verified and replaces the stored one
    pub scanned: BTreeSet<String>,
    pub scan_updates: ScanState,
}

/// Variants seen in the corpus, or the default `#1$1` when none were seen.
pub fn metadata_variants(char_id: &str, observed: &BTreeSet<String>) -> Vec<String> {
    let variants: Vec<String> = observed
        .iter()
        .filter(|v| base_of(v) == char_id)
        .cloned()
        .collect();
    if variants.is_empty() {
        vec![default_variant(char_id)]
    } else {
        variants
    }
}

/// Probes every candidate. A failed probe keeps the variant; an empty result
/// falls back to the default variant.
pub fn verify_variants(char_id: &str, candidates: &[String], probe: &dyn AssetProbe) -> Vec<String> {
    let mut verified = BTreeSet::new();
    for variant in candidates {
        match probe.exists(variant) {
            Ok(true) => {
                verified.insert(variant.clone());
            }
            Ok(false) => {}
            Err(err) => {
                log::warn!("[VARIANT] probe failed for {}, keeping it: {}", variant, err);
                verified.insert(variant.clone());
            }
        }
    }
    if verified.is_empty() {
        vec![default_variant(char_id)]
    } else {
        verified.into_iter().collect()
    }
}

fn is_stale(scan_state: &ScanState, char_id: &str, now: i64) -> bool {
    match scan_state.get(char_id) {
        Some(entry) => now - entry.last_scan_time >= RESCAN_INTERVAL_MS,
        None => true,
    }
}

/// 生成本轮每个角色的有效差分列表。
///
/// Metadata-only mode uses the observed variants. Verified mode probes up to
/// `max_scans` stale characters across the worker pool; characters left
/// unscanned keep their stored list, or fall back to the metadata list when
/// they are new.
pub fn generate_variants(
    results: &ParseResults,
    existing: &CharacterTable,
    scan_state: &ScanState,
    options: &VariantOptions,
    probe: Option<&dyn AssetProbe>,
) -> PipelineResult<VariantPlan> {
    let mut plan = VariantPlan::default();
    for (char_id, result) in results {
        plan.variants
            .insert(char_id.clone(), metadata_variants(char_id, &result.variants));
    }

    let probe = match (options.check_images, probe) {
        (true, Some(probe)) => probe,
        (true, None) => {
            log::warn!("[VARIANT] image check requested without a probe, using metadata only");
            return Ok(plan);
        }
        (false, _) => return Ok(plan),
    };

    let mut due: Vec<(i64, String)> = results
        .keys()
        .filter(|id| options.force || is_stale(scan_state, id, options.now))
        .map(|id| {
            let last = scan_state.get(id).map(|e| e.last_scan_time).unwrap_or(0);
            (last, id.clone())
        })
        .collect();
    due.sort();
    let skipped = due.len().saturating_sub(options.max_scans);
    due.truncate(options.max_scans);

    for char_id in results.keys() {
        if due.iter().any(|(_, id)| id == char_id) {
            continue;
        }
        if let Some(record) = existing.get(char_id) {
            if !record.valid_variants.is_empty() {
                plan.variants
                    .insert(char_id.clone(), record.valid_variants.clone());
            }
        }
    }

    if due.is_empty() {
        return Ok(plan);
    }
    log::info!(
        "[VARIANT] verifying {} characters ({} deferred to a later run)",
        due.len(),
        skipped
    );

    let jobs: Vec<(String, Vec<String>)> = due
        .into_iter()
        .map(|(_, char_id)| {
            let mut candidates: BTreeSet<String> = results[&char_id]
                .variants
                .iter()
                .filter(|v| base_of(v) == char_id)
                .cloned()
                .collect();
            if let Some(record) = existing.get(&char_id) {
                candidates.extend(record.valid_variants.iter().cloned());
            }
            candidates.insert(default_variant(&char_id));
            (char_id, candidates.into_iter().collect())
        })
        .collect();

    let chunks = partition(&jobs, options.workers.clamp(1, DEFAULT_IMAGE_WORKERS));
    let verified = run_chunks("variant", chunks, |_, chunk| {
        Ok(chunk
            .into_iter()
            .map(|(char_id, candidates)| {
                let variants = verify_variants(&char_id, &candidates, probe);
                (char_id, variants)
            })
            .collect::<Vec<_>>())
    })?;

    for (char_id, variants) in verified.into_iter().flatten() {
        plan.scan_updates.insert(
            char_id.clone(),
            ScanEntry {
                last_scan_time: options.now,
                variant_count: variants.len(),
            },
        );
        plan.scanned.insert(char_id.clone());
        plan.variants.insert(char_id, variants);
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CharacterRecord, ParseResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedProbe {
        present: BTreeSet<String>,
        calls: AtomicUsize,
    }

    impl FixedProbe {
        fn new(present: &[&str]) -> Self {
            Self {
                present: present.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl AssetProbe for FixedProbe {
        fn exists(&self, variant: &str) -> PipelineResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if variant.contains("#9$") {
                return Err(PipelineError::Http {
                    url: variant.to_string(),
                    message: "timeout".to_string(),
                });
            }
            Ok(self.present.contains(variant))
        }
    }

    fn results_with(ids: &[(&str, &[&str])]) -> ParseResults {
        ids.iter()
            .map(|(id, variants)| {
                let mut r = ParseResult::new(id);
                r.variants = variants.iter().map(|v| v.to_string()).collect();
                (id.to_string(), r)
            })
            .collect()
    }

    #[test]
    fn metadata_mode_uses_observed_or_default() {
        let results = results_with(&[
            ("char_002_amiya", &["char_002_amiya#2$1", "char_002_amiya#1$1"]),
            ("npc_001", &[]),
        ]);
        let plan = generate_variants(
            &results,
            &CharacterTable::new(),
            &ScanState::new(),
            &VariantOptions::default(),
            None,
        )
        .unwrap();

        assert_eq!(
            plan.variants["char_002_amiya"],
            vec!["char_002_amiya#1$1", "char_002_amiya#2$1"]
        );
        assert_eq!(plan.variants["npc_001"], vec!["npc_001#1$1"]);
        assert!(plan.scanned.is_empty());
        assert!(plan.scan_updates.is_empty());
    }

    #[test]
    fn verified_mode_probes_stale_characters() {
        let results = results_with(&[
            ("char_a", &["char_a#1$1", "char_a#2$1"]),
            ("char_b", &["char_b#1$1"]),
        ]);
        let probe = FixedProbe::new(&["char_a#2$1", "char_b#1$1"]);
        let now = 10 * RESCAN_INTERVAL_MS;
        let mut scan_state = ScanState::new();
        scan_state.insert(
            "char_b".to_string(),
            ScanEntry {
                last_scan_time: now - 1000,
                variant_count: 1,
            },
        );
        let mut existing = CharacterTable::new();
        let mut b = CharacterRecord::new("char_b");
        b.valid_variants = vec!["char_b#1$1".to_string(), "char_b#3$1".to_string()];
        existing.insert("char_b".to_string(), b);

        let options = VariantOptions {
            check_images: true,
            now,
            ..Default::default()
        };
        let plan = generate_variants(&results, &existing, &scan_state, &options, Some(&probe))
            .unwrap();

        assert_eq!(plan.variants["char_a"], vec!["char_a#2$1"]);
        assert!(plan.scanned.contains("char_a"));
        assert_eq!(plan.scan_updates["char_a"].variant_count, 1);
        assert_eq!(plan.scan_updates["char_a"].last_scan_time, now);
        // char_b 刚扫描过，保留原列表
        assert!(!plan.scanned.contains("char_b"));
        assert_eq!(plan.variants["char_b"], vec!["char_b#1$1", "char_b#3$1"]);
    }

    #[test]
    fn scans_are_capped_per_run() {
        let results = results_with(&[("char_a", &[]), ("char_b", &[]), ("char_c", &[])]);
        let probe = FixedProbe::new(&[]);
        let options = VariantOptions {
            check_images: true,
            max_scans: 2,
            workers: 2,
            ..Default::default()
        };
        let plan = generate_variants(
            &results,
            &CharacterTable::new(),
            &ScanState::new(),
            &options,
            Some(&probe),
        )
        .unwrap();
        assert_eq!(plan.scanned.len(), 2);
        assert_eq!(plan.variants.len(), 3);
    }

    #[test]
    fn force_rescans_fresh_characters() {
        let results = results_with(&[("char_a", &["char_a#1$1"])]);
        let mut scan_state = ScanState::new();
        scan_state.insert(
            "char_a".to_string(),
            ScanEntry {
                last_scan_time: 0,
                variant_count: 1,
            },
        );
        let probe = FixedProbe::new(&["char_a#1$1"]);
        let options = VariantOptions {
            check_images: true,
            force: true,
            now: 1,
            ..Default::default()
        };
        let plan = generate_variants(&results, &CharacterTable::new(), &scan_state, &options, Some(&probe))
            .unwrap();
        assert!(plan.scanned.contains("char_a"));
    }

    #[test]
    fn probe_errors_keep_the_variant() {
        let probe = FixedProbe::new(&[]);
        let verified = verify_variants(
            "char_a",
            &["char_a#9$1".to_string(), "char_a#2$1".to_string()],
            &probe,
        );
        assert_eq!(verified, vec!["char_a#9$1"]);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);

        let none = verify_variants("char_a", &["char_a#2$1".to_string()], &probe);
        assert_eq!(none, vec!["char_a#1$1"]);
    }

    #[test]
    fn url_template_is_filled() {
        let probe = HttpAssetProbe::new(
            "https://assets.example.invalid/avg/{charId}/{variant}.png",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            probe.url_for("char_002_amiya#1$1"),
            "https://assets.example.invalid/avg/char_002_amiya/char_002_amiya%231%241.png"
        );
    }
}
