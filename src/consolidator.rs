//! Merges one language pass into the persisted tables.
//!
//! [`consolidate`] computes the complete next state in memory; callers
//! persist it only after it returns, so a failed pass never leaves half
//! written output behind.

use std::collections::{BTreeMap, BTreeSet};

use crate::data_service::is_story_allowed;
use crate::models::{
    CharacterRecord, NameRecord, ParseResult, ParseResults, ScanEntry, SearchEntry, SearchIndex,
    Tables,
};
use crate::normalizer::base_of;
use crate::rules::{GlobalRules, LanguageRules};
use crate::variants::{metadata_variants, VariantPlan};

pub struct ConsolidationContext<'a> {
    pub lang: &'a str,
    pub is_master: bool,
    pub global: &'a GlobalRules,
    pub rules: &'a LanguageRules,
    /// `None` when the allowlist could not be fetched; pruning is skipped.
    pub allowlist: Option<&'a BTreeSet<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsolidationReport {
    pub characters_touched: usize,
    pub fixes_removed: usize,
    pub excluded_names: usize,
    pub stories_pruned: usize,
    pub names_pruned: usize,
    pub search_entries: usize,
}

fn rename_variant(variant: &str, from: &str, to: &str) -> String {
    if from != to && base_of(variant) == from {
        format!("{}{}", to, &variant[from.len()..])
    } else {
        variant.to_string()
    }
}

/// 按修正表把解析结果归并到最终 id 下
fn group_by_target(
    results: &ParseResults,
    plan: &VariantPlan,
    global: &GlobalRules,
) -> BTreeMap<String, (ParseResult, BTreeSet<String>, bool)> {
    let mut grouped: BTreeMap<String, (ParseResult, BTreeSet<String>, bool)> = BTreeMap::new();
    for (base_id, data) in results {
        let target = global.fix(base_id);
        let variants: Vec<String> = plan
            .variants
            .get(base_id)
            .cloned()
            .unwrap_or_else(|| metadata_variants(base_id, &data.variants));
        let scanned = plan.scanned.contains(base_id);

        let mut renamed = data.clone();
        renamed.char_id = target.clone();
        renamed.variants = data
            .variants
            .iter()
            .map(|v| rename_variant(v, base_id, &target))
            .collect();

        let entry = grouped
            .entry(target.clone())
            .or_insert_with(|| (ParseResult::new(&target), BTreeSet::new(), false));
        entry.0.absorb(renamed);
        entry
            .1
            .extend(variants.iter().map(|v| rename_variant(v, base_id, &target)));
        entry.2 |= scanned;
    }
    grouped
}

fn recompute_display_name(char_id: &str, record: &mut NameRecord) {
    if !record.speaker_names.contains(&record.display_name) {
        record.display_name = record
            .speaker_names
            .first()
            .cloned()
            .unwrap_or_else(|| char_id.to_string());
    }
}

/// 根据本轮解析结果计算新的全部表。
pub fn consolidate(
    mut tables: Tables,
    results: &ParseResults,
    plan: &VariantPlan,
    ctx: &ConsolidationContext<'_>,
) -> (Tables, ConsolidationReport) {
    let mut report = ConsolidationReport::default();
    let grouped = group_by_target(results, plan, ctx.global);

    // 扫描时间只随差分列表一起写入
    let mut scan_times: BTreeMap<String, i64> = BTreeMap::new();
    for (base_id, update) in &plan.scan_updates {
        let time = scan_times.entry(ctx.global.fix(base_id)).or_insert(0);
        *time = (*time).max(update.last_scan_time);
    }

    for (target, (data, variants, scanned)) in &grouped {
        report.characters_touched += 1;

        let is_new = !tables.characters.contains_key(target);
        if ctx.is_master || is_new {
            let record = tables
                .characters
                .entry(target.clone())
                .or_insert_with(|| CharacterRecord::new(target));
            let merged: BTreeSet<String> = if *scanned {
                variants.iter().cloned().collect()
            } else {
                record
                    .valid_variants
                    .iter()
                    .cloned()
                    .chain(variants.iter().cloned())
                    .collect()
            };
            record.valid_variants = merged.into_iter().collect();
            record.dialog_count = data.dialog_count;

            let variant_count = record.valid_variants.len();
            if *scanned {
                if let Some(&last_scan_time) = scan_times.get(target) {
                    tables.scan_state.insert(
                        target.clone(),
                        ScanEntry {
                            last_scan_time,
                            variant_count,
                        },
                    );
                }
            } else if ctx.is_master {
                tables
                    .scan_state
                    .entry(target.clone())
                    .and_modify(|entry| entry.variant_count = variant_count)
                    .or_insert(ScanEntry {
                        last_scan_time: 0,
                        variant_count,
                    });
            }
        }

        if !data.speaker_names.is_empty() {
            let speaker_names: Vec<String> = data.speaker_names.iter().cloned().collect();
            let display_name = tables
                .names
                .get(target)
                .map(|r| r.display_name.clone())
                .filter(|name| data.speaker_names.contains(name))
                .or_else(|| data.dominant_name().map(|s| s.to_string()))
                .unwrap_or_else(|| target.clone());
            tables.names.insert(
                target.clone(),
                NameRecord {
                    search_names: speaker_names.clone(),
                    speaker_names,
                    display_name,
                },
            );
        } else if !tables.names.contains_key(target) {
            tables.names.insert(
                target.clone(),
                NameRecord {
                    speaker_names: Vec::new(),
                    search_names: Vec::new(),
                    display_name: target.clone(),
                },
            );
        }

        let stories = tables.storys.entry(target.clone()).or_default();
        let merged: BTreeSet<String> = stories
            .iter()
            .cloned()
            .chain(data.story_files.iter().cloned())
            .collect();
        *stories = merged.into_iter().collect();
    }

    // 修正表是硬合并：源 id 的残留记录全部删除
    for (source, target) in &ctx.global.character_fixes {
        if source == target {
            continue;
        }
        let removed = tables.characters.remove(source).is_some()
            | tables.names.remove(source).is_some()
            | tables.storys.remove(source).is_some()
            | tables.scan_state.remove(source).is_some();
        if removed {
            report.fixes_removed += 1;
        }
    }

    for (name, char_ids) in &ctx.rules.name_excludes {
        for char_id in char_ids {
            if let Some(record) = tables.names.get_mut(char_id) {
                let before = record.speaker_names.len() + record.search_names.len();
                record.speaker_names.retain(|n| n != name);
                record.search_names.retain(|n| n != name);
                if record.speaker_names.len() + record.search_names.len() != before {
                    report.excluded_names += 1;
                }
                recompute_display_name(char_id, record);
            }
        }
    }

    if let Some(allowlist) = ctx.allowlist {
        for stories in tables.storys.values_mut() {
            let before = stories.len();
            stories.retain(|path| is_story_allowed(allowlist, path));
            report.stories_pruned += before - stories.len();
        }
    }
    tables.storys.retain(|_, stories| !stories.is_empty());

    let storys = &tables.storys;
    let before = tables.names.len();
    tables.names.retain(|char_id, _| storys.contains_key(char_id));
    report.names_pruned = before - tables.names.len();

    tables.search_index = build_search_index(&tables.names, ctx.rules);
    report.search_entries = tables.search_index.len();

    log::info!(
        "[CONSOLIDATE] {}: {} characters, {} stories pruned, {} names pruned, {} search entries",
        ctx.lang,
        report.characters_touched,
        report.stories_pruned,
        report.names_pruned,
        report.search_entries
    );

    (tables, report)
}

/// 从名字表重建搜索索引；同名的多个角色提升为数组
pub fn build_search_index(
    names: &BTreeMap<String, NameRecord>,
    rules: &LanguageRules,
) -> SearchIndex {
    let mut index = SearchIndex::new();
    for (char_id, record) in names {
        let target = rules.combine(char_id);
        let candidates: BTreeSet<&str> = std::iter::once(record.display_name.as_str())
            .chain(record.speaker_names.iter().map(|s| s.as_str()))
            .chain(record.search_names.iter().map(|s| s.as_str()))
            .filter(|name| !name.trim().is_empty())
            .collect();

        for name in candidates {
            if rules.is_name_excluded(name, char_id) || rules.is_name_excluded(name, target) {
                continue;
            }
            match index.get_mut(name) {
                Some(entry) => entry.push(target),
                None => {
                    index.insert(name.to_string(), SearchEntry::Single(target.to_string()));
                }
            }
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_story_cast;

    fn result(char_id: &str, names: &[&str], stories: &[&str]) -> ParseResult {
        let mut r = ParseResult::new(char_id);
        for name in names {
            r.speaker_names.insert(name.to_string());
            r.name_counts.insert(name.to_string(), 1);
            r.dialog_count += 1;
        }
        r.story_files = stories.iter().map(|s| s.to_string()).collect();
        r.variants.insert(format!("{}#1$1", char_id));
        r
    }

    fn results(items: Vec<ParseResult>) -> ParseResults {
        items.into_iter().map(|r| (r.char_id.clone(), r)).collect()
    }

    fn ctx<'a>(global: &'a GlobalRules, rules: &'a LanguageRules) -> ConsolidationContext<'a> {
        ConsolidationContext {
            lang: "en_US",
            is_master: true,
            global,
            rules,
            allowlist: None,
        }
    }

    #[test]
    fn end_to_end_single_story() {
        let global = GlobalRules::default();
        let rules = LanguageRules::default();
        let parsed = parse_story_cast(
            "[Character(name=char_002_amiya#1,focus=1)]\n[name=\"Amiya\"]Hello.",
            "obt/main/level_main_00-01_beg",
            "en_US",
            &global,
            &rules,
        );
        let (tables, _) = consolidate(
            Tables::default(),
            &parsed,
            &VariantPlan::default(),
            &ctx(&global, &rules),
        );

        assert_eq!(tables.names["char_002_amiya"].speaker_names, vec!["Amiya"]);
        assert_eq!(tables.names["char_002_amiya"].display_name, "Amiya");
        assert_eq!(
            tables.search_index["Amiya"],
            SearchEntry::Single("char_002_amiya".to_string())
        );
        assert_eq!(
            tables.characters["char_002_amiya"].valid_variants,
            vec!["char_002_amiya#1$1"]
        );
        assert_eq!(tables.characters["char_002_amiya"].dialog_count, 1);
        assert_eq!(
            tables.storys["char_002_amiya"],
            vec!["obt/main/level_main_00-01_beg"]
        );
    }

    #[test]
    fn consolidation_is_idempotent() {
        let global = GlobalRules::default();
        let rules = LanguageRules::default();
        let parsed = results(vec![
            result("char_a", &["Closure"], &["s/1"]),
            result("char_b", &["Closure", "Bee"], &["s/2"]),
        ]);
        let plan = VariantPlan::default();

        let (once, _) = consolidate(Tables::default(), &parsed, &plan, &ctx(&global, &rules));
        let (twice, _) = consolidate(once.clone(), &parsed, &plan, &ctx(&global, &rules));

        assert_eq!(once, twice);
        assert_eq!(
            serde_json::to_string_pretty(&once.search_index).unwrap(),
            serde_json::to_string_pretty(&twice.search_index).unwrap()
        );
        assert_eq!(
            serde_json::to_string_pretty(&once.characters).unwrap(),
            serde_json::to_string_pretty(&twice.characters).unwrap()
        );
    }

    #[test]
    fn shared_names_become_arrays() {
        let global = GlobalRules::default();
        let rules = LanguageRules::default();
        let parsed = results(vec![
            result("char_a", &["Closure"], &["s/1"]),
            result("char_b", &["Closure"], &["s/2"]),
        ]);
        let (tables, _) =
            consolidate(Tables::default(), &parsed, &VariantPlan::default(), &ctx(&global, &rules));

        assert_eq!(
            tables.search_index["Closure"],
            SearchEntry::Multiple(vec!["char_a".to_string(), "char_b".to_string()])
        );
    }

    #[test]
    fn combine_rules_redirect_search_entries() {
        let global = GlobalRules::default();
        let mut rules = LanguageRules::default();
        rules
            .combine_rules
            .insert("char_b".to_string(), "char_a".to_string());
        let parsed = results(vec![
            result("char_a", &["Closure"], &["s/1"]),
            result("char_b", &["Closure", "Boss"], &["s/2"]),
        ]);
        let (tables, _) =
            consolidate(Tables::default(), &parsed, &VariantPlan::default(), &ctx(&global, &rules));

        assert_eq!(
            tables.search_index["Closure"],
            SearchEntry::Single("char_a".to_string())
        );
        assert_eq!(
            tables.search_index["Boss"],
            SearchEntry::Single("char_a".to_string())
        );
        // 合并规则不影响底层记录
        assert!(tables.names.contains_key("char_b"));
    }

    #[test]
    fn excluded_pairs_never_survive() {
        let global = GlobalRules::default();
        let mut rules = LanguageRules::default();
        rules
            .name_excludes
            .insert("Amiya".to_string(), vec!["char_1001_amiya2".to_string()]);

        let mut tables = Tables::default();
        tables.names.insert(
            "char_1001_amiya2".to_string(),
            NameRecord {
                speaker_names: vec!["Amiya".to_string()],
                search_names: vec!["Amiya".to_string()],
                display_name: "Amiya".to_string(),
            },
        );
        tables
            .storys
            .insert("char_1001_amiya2".to_string(), vec!["s/0".to_string()]);

        let parsed = results(vec![
            result("char_1001_amiya2", &["Amiya", "Amiya (Guard)"], &["s/1"]),
            result("char_002_amiya", &["Amiya"], &["s/2"]),
        ]);
        let (tables, _) =
            consolidate(tables, &parsed, &VariantPlan::default(), &ctx(&global, &rules));

        let guard = &tables.names["char_1001_amiya2"];
        assert_eq!(guard.speaker_names, vec!["Amiya (Guard)"]);
        assert_eq!(guard.display_name, "Amiya (Guard)");
        assert_eq!(
            tables.search_index["Amiya"],
            SearchEntry::Single("char_002_amiya".to_string())
        );
    }

    #[test]
    fn fixes_are_hard_merges() {
        let mut global = GlobalRules::default();
        global
            .character_fixes
            .insert("char_old".to_string(), "char_new".to_string());
        let rules = LanguageRules::default();

        let mut tables = Tables::default();
        tables
            .characters
            .insert("char_old".to_string(), CharacterRecord::new("char_old"));
        tables
            .storys
            .insert("char_old".to_string(), vec!["s/0".to_string()]);

        let parsed = results(vec![result("char_old", &["Oldie"], &["s/1"])]);
        let (tables, report) =
            consolidate(tables, &parsed, &VariantPlan::default(), &ctx(&global, &rules));

        assert!(!tables.characters.contains_key("char_old"));
        assert!(!tables.storys.contains_key("char_old"));
        assert_eq!(
            tables.characters["char_new"].valid_variants,
            vec!["char_new#1$1"]
        );
        assert_eq!(tables.names["char_new"].speaker_names, vec!["Oldie"]);
        assert_eq!(report.fixes_removed, 1);
    }

    #[test]
    fn allowlist_prunes_stories_and_names() {
        let global = GlobalRules::default();
        let rules = LanguageRules::default();
        let allowlist: BTreeSet<String> = ["obt/main/kept"].iter().map(|s| s.to_string()).collect();
        let parsed = results(vec![
            result("char_a", &["Kept"], &["obt/main/kept", "obt/main/removed"]),
            result("char_b", &["Gone"], &["obt/main/removed"]),
        ]);
        let context = ConsolidationContext {
            allowlist: Some(&allowlist),
            ..ctx(&global, &rules)
        };
        let (tables, report) =
            consolidate(Tables::default(), &parsed, &VariantPlan::default(), &context);

        assert_eq!(tables.storys["char_a"], vec!["obt/main/kept"]);
        assert!(!tables.storys.contains_key("char_b"));
        assert!(!tables.names.contains_key("char_b"));
        assert!(!tables.search_index.contains_key("Gone"));
        // 全局角色表不因某个语言缺少剧情而删除
        assert!(tables.characters.contains_key("char_b"));
        assert_eq!(report.stories_pruned, 2);
        assert_eq!(report.names_pruned, 1);
    }

    #[test]
    fn missing_allowlist_skips_pruning() {
        let global = GlobalRules::default();
        let rules = LanguageRules::default();
        let parsed = results(vec![result("char_a", &["A"], &["anything/at/all"])]);
        let (tables, _) =
            consolidate(Tables::default(), &parsed, &VariantPlan::default(), &ctx(&global, &rules));
        assert_eq!(tables.storys["char_a"], vec!["anything/at/all"]);
    }

    #[test]
    fn non_master_does_not_touch_existing_characters() {
        let global = GlobalRules::default();
        let rules = LanguageRules::default();
        let mut tables = Tables::default();
        let mut record = CharacterRecord::new("char_a");
        record.valid_variants = vec!["char_a#1$1".to_string()];
        record.dialog_count = 40;
        tables.characters.insert("char_a".to_string(), record);

        let mut parsed_a = result("char_a", &["A"], &["s/1"]);
        parsed_a.variants.insert("char_a#7$1".to_string());
        let parsed = results(vec![parsed_a, result("npc_new", &["New"], &["s/2"])]);
        let context = ConsolidationContext {
            is_master: false,
            ..ctx(&global, &rules)
        };
        let (tables, _) = consolidate(tables, &parsed, &VariantPlan::default(), &context);

        assert_eq!(tables.characters["char_a"].valid_variants, vec!["char_a#1$1"]);
        assert_eq!(tables.characters["char_a"].dialog_count, 40);
        assert!(tables.characters.contains_key("npc_new"));
        assert!(tables.scan_state.is_empty());
    }

    #[test]
    fn names_are_replaced_not_unioned() {
        let global = GlobalRules::default();
        let rules = LanguageRules::default();
        let (first, _) = consolidate(
            Tables::default(),
            &results(vec![result("char_a", &["Old Name"], &["s/1"])]),
            &VariantPlan::default(),
            &ctx(&global, &rules),
        );
        let (second, _) = consolidate(
            first,
            &results(vec![result("char_a", &["New Name"], &["s/2"])]),
            &VariantPlan::default(),
            &ctx(&global, &rules),
        );
        assert_eq!(second.names["char_a"].speaker_names, vec!["New Name"]);
        assert_eq!(second.storys["char_a"], vec!["s/1", "s/2"]);

        let (third, _) = consolidate(
            second,
            &results(vec![result("char_a", &[], &["s/3"])]),
            &VariantPlan::default(),
            &ctx(&global, &rules),
        );
        assert_eq!(third.names["char_a"].speaker_names, vec!["New Name"]);
    }

    #[test]
    fn scanned_variants_replace_stored_list() {
        let global = GlobalRules::default();
        let rules = LanguageRules::default();
        let mut tables = Tables::default();
        let mut record = CharacterRecord::new("char_a");
        record.valid_variants = vec!["char_a#1$1".to_string(), "char_a#5$1".to_string()];
        tables.characters.insert("char_a".to_string(), record);

        let mut plan = VariantPlan::default();
        plan.variants
            .insert("char_a".to_string(), vec!["char_a#2$1".to_string()]);
        plan.scanned.insert("char_a".to_string());
        plan.scan_updates.insert(
            "char_a".to_string(),
            ScanEntry {
                last_scan_time: 42,
                variant_count: 1,
            },
        );

        let parsed = results(vec![result("char_a", &["A"], &["s/1"])]);
        let (tables, _) = consolidate(tables, &parsed, &plan, &ctx(&global, &rules));
        assert_eq!(tables.characters["char_a"].valid_variants, vec!["char_a#2$1"]);
        assert_eq!(tables.scan_state["char_a"].last_scan_time, 42);
    }

    #[test]
    fn non_master_scan_of_existing_character_is_not_recorded() {
        let global = GlobalRules::default();
        let rules = LanguageRules::default();
        let mut tables = Tables::default();
        let mut record = CharacterRecord::new("char_a");
        record.valid_variants = vec!["char_a#1$1".to_string(), "char_a#5$1".to_string()];
        tables.characters.insert("char_a".to_string(), record);
        tables.scan_state.insert(
            "char_a".to_string(),
            ScanEntry {
                last_scan_time: 7,
                variant_count: 2,
            },
        );

        let mut plan = VariantPlan::default();
        for id in ["char_a", "char_new"] {
            plan.variants
                .insert(id.to_string(), vec![format!("{}#2$1", id)]);
            plan.scanned.insert(id.to_string());
            plan.scan_updates.insert(
                id.to_string(),
                ScanEntry {
                    last_scan_time: 42,
                    variant_count: 1,
                },
            );
        }

        let parsed = results(vec![
            result("char_a", &["A"], &["s/1"]),
            result("char_new", &["New"], &["s/2"]),
        ]);
        let context = ConsolidationContext {
            is_master: false,
            ..ctx(&global, &rules)
        };
        let (tables, _) = consolidate(tables, &parsed, &plan, &context);

        assert_eq!(
            tables.characters["char_a"].valid_variants,
            vec!["char_a#1$1", "char_a#5$1"]
        );
        assert_eq!(
            tables.scan_state["char_a"],
            ScanEntry {
                last_scan_time: 7,
                variant_count: 2,
            }
        );
        // 新角色的列表由本轮写入，扫描记录随之写入
        assert_eq!(tables.characters["char_new"].valid_variants, vec!["char_new#2$1"]);
        assert_eq!(tables.scan_state["char_new"].last_scan_time, 42);
        assert_eq!(tables.scan_state["char_new"].variant_count, 1);
    }

    #[test]
    fn rename_variant_only_touches_matching_base() {
        assert_eq!(rename_variant("char_old#2$1", "char_old", "char_new"), "char_new#2$1");
        assert_eq!(rename_variant("char_older#2$1", "char_old", "char_new"), "char_older#2$1");
    }
}
