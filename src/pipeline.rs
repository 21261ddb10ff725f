use std::collections::BTreeSet;
use std::time::Instant;

use crate::config::PipelineConfig;
use crate::consolidator::{consolidate, ConsolidationContext, ConsolidationReport};
use crate::data_service::{DataService, StoryFile, WriteSummary};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{merge_parse_results, ParseResults};
use crate::parser::parse_story_cast;
use crate::pool::{partition, reduce_parse_results, run_chunks};
use crate::rules::{GlobalRules, LanguageRules, RuleCache};
use crate::variants::{generate_variants, AssetProbe, HttpAssetProbe, VariantOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct PassSummary {
    pub lang: String,
    pub story_files: usize,
    pub characters: usize,
    pub scanned: usize,
    pub report: ConsolidationReport,
    pub writes: Option<WriteSummary>,
}

/// 多线程解析一批剧本文件并合并结果
pub fn parse_files(
    files: Vec<StoryFile>,
    lang: &str,
    workers: usize,
    global: &GlobalRules,
    rules: &LanguageRules,
) -> PipelineResult<ParseResults> {
    let chunks = partition(&files, workers);
    let partials = run_chunks("parse", chunks, |index, chunk| {
        log::debug!("[PARSE] worker {} got {} files", index, chunk.len());
        let mut partial = ParseResults::new();
        for file in chunk {
            let text = DataService::read_story_text(&file.path)?;
            let parsed = parse_story_cast(&text, &file.id, lang, global, rules);
            merge_parse_results(&mut partial, parsed);
        }
        Ok(partial)
    })?;
    Ok(reduce_parse_results(partials))
}

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    rules: &'a RuleCache,
    service: DataService,
    probe: Option<Box<dyn AssetProbe>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig, rules: &'a RuleCache) -> PipelineResult<Self> {
        config.validate()?;
        let probe: Option<Box<dyn AssetProbe>> =
            match (config.check_images, config.image_url_template.as_deref()) {
                (true, Some(template)) => Some(Box::new(HttpAssetProbe::new(
                    template,
                    config.http_timeout(),
                )?)),
                (true, None) => {
                    log::warn!("[VARIANT] checkImages is set but imageUrlTemplate is missing");
                    None
                }
                (false, _) => None,
            };

        Ok(Self {
            config,
            rules,
            service: DataService::new(&config.data_dir, &config.output_dir),
            probe,
        })
    }

    pub fn with_probe(mut self, probe: Box<dyn AssetProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    fn fetch_allowlist(&self, lang: &str) -> Option<BTreeSet<String>> {
        let source = self.config.story_review.resolve(lang);
        match self
            .service
            .fetch_story_allowlist(&source, self.config.http_timeout())
        {
            Ok(allowlist) if !allowlist.is_empty() => {
                log::info!("[SYNC] {}: {} valid story paths", lang, allowlist.len());
                Some(allowlist)
            }
            Ok(_) => {
                log::warn!("[SYNC] {}: story review table is empty, skipping pruning", lang);
                None
            }
            Err(err) => {
                log::warn!("[SYNC] {}: story review table unavailable, skipping pruning: {}", lang, err);
                None
            }
        }
    }

    /// 处理单个语言：解析 → 差分 → 整理 → 写入
    pub fn run_language(&self, lang: &str) -> PipelineResult<PassSummary> {
        let started = Instant::now();
        let global = self.rules.global()?;
        let lang_rules = self.rules.language(lang)?;

        let files = self.service.list_story_files(lang)?;
        let story_files = files.len();
        log::info!("[PARSE] {}: {} story files", lang, story_files);
        let results = parse_files(files, lang, self.config.workers, &global, &lang_rules)?;
        log::info!(
            "[PARSE] {}: {} characters in {:.2?}",
            lang,
            results.len(),
            started.elapsed()
        );

        let tables = self.service.load_tables(lang)?;
        let options = VariantOptions {
            check_images: self.config.check_images,
            force: self.config.force_scan,
            max_scans: self.config.max_scans,
            workers: self.config.image_workers,
            ..Default::default()
        };
        let plan = generate_variants(
            &results,
            &tables.characters,
            &tables.scan_state,
            &options,
            self.probe.as_deref(),
        )?;

        let allowlist = self.fetch_allowlist(lang);
        let ctx = ConsolidationContext {
            lang,
            is_master: lang == self.config.master_language,
            global: &global,
            rules: &lang_rules,
            allowlist: allowlist.as_ref(),
        };
        let (next, report) = consolidate(tables, &results, &plan, &ctx);

        let writes = if self.config.dry_run {
            log::info!("[SYNC] {}: dry run, nothing written", lang);
            None
        } else {
            let summary = self.service.save_tables(lang, &next)?;
            log::info!(
                "[SYNC] {}: {} files written, {} unchanged",
                lang,
                summary.written,
                summary.unchanged
            );
            Some(summary)
        };

        log::info!("[SYNC] {} finished in {:.2?}", lang, started.elapsed());
        Ok(PassSummary {
            lang: lang.to_string(),
            story_files,
            characters: results.len(),
            scanned: plan.scanned.len(),
            report,
            writes,
        })
    }

    /// 依次处理所有语言，主语言优先；任一语言失败即中止
    pub fn run_all(&self) -> PipelineResult<Vec<PassSummary>> {
        let mut summaries = Vec::new();
        for lang in self.config.ordered_languages() {
            if !self.service.is_installed(&lang) {
                log::warn!("[SYNC] {}: no story data under {}, skipping", lang, self.service.story_dir(&lang).display());
                continue;
            }
            summaries.push(self.run_language(&lang)?);
        }
        if summaries.is_empty() {
            return Err(PipelineError::Config(format!(
                "no story data found under {}",
                self.config.data_dir.display()
            )));
        }
        Ok(summaries)
    }
}
