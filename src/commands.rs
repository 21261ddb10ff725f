//! 命令行入口
//!
//! ```text
//! story-cast [OPTIONS]                 consolidate every configured language
//! story-cast parse <FILE> [--lang L]   dump the cast of one script as JSON
//! ```

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{PipelineConfig, SourceRef};
use crate::data_service::DataService;
use crate::parser::parse_story_cast;
use crate::pipeline::Pipeline;
use crate::rules::RuleCache;

pub fn print_usage() {
    eprintln!(
        r#"
story-cast - consolidate Arknights story scripts into character tables

USAGE:
    story-cast [OPTIONS]
    story-cast parse <FILE> [--lang <LANG>] [--rules-dir <DIR>] [--id <STORY_ID>]

OPTIONS:
    -c, --config <FILE>         JSON config file (flags override it)
    -d, --data-dir <DIR>        Game data root containing <lang>/gamedata/story
    -o, --output-dir <DIR>      Output root
    -r, --rules-dir <DIR>       Rule tables root
    -l, --lang <LANG>           Language to process, repeatable
        --master <LANG>         Master language (default: zh_CN)
    -w, --workers <N>           Parse workers (default: CPU count)
        --check-images          Verify variants against the image host
        --image-url <TEMPLATE>  Image URL, {{variant}} and {{charId}} are substituted
        --image-workers <N>     Concurrent image probes (default: 6)
        --max-scans <N>         Characters verified per pass (default: 300)
        --force-scan            Ignore the daily rescan throttle
        --story-review <SRC>    story_review_table.json URL or path, {{lang}} is substituted
        --timeout <SECS>        HTTP timeout (default: 30)
        --dry-run               Run everything but write nothing
    -v, --verbose               Debug logging
    -h, --help                  Print this help message
"#
    );
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunArgs {
    pub config: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub rules_dir: Option<PathBuf>,
    pub languages: Vec<String>,
    pub master_language: Option<String>,
    pub workers: Option<usize>,
    pub check_images: bool,
    pub image_url: Option<String>,
    pub image_workers: Option<usize>,
    pub max_scans: Option<usize>,
    pub force_scan: bool,
    pub story_review: Option<String>,
    pub timeout_secs: Option<u64>,
    pub dry_run: bool,
}

impl RunArgs {
    /// 先读配置文件，再用命令行参数覆盖
    pub fn into_config(self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => PipelineConfig::default(),
        };

        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if let Some(dir) = self.rules_dir {
            config.rules_dir = dir;
        }
        if !self.languages.is_empty() {
            config.languages = self.languages;
        }
        if let Some(lang) = self.master_language {
            config.master_language = lang;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        config.check_images |= self.check_images;
        if let Some(url) = self.image_url {
            config.image_url_template = Some(url);
        }
        if let Some(n) = self.image_workers {
            config.image_workers = n;
        }
        if let Some(n) = self.max_scans {
            config.max_scans = n;
        }
        config.force_scan |= self.force_scan;
        if let Some(source) = self.story_review {
            config.story_review = SourceRef::Plain(source);
        }
        if let Some(secs) = self.timeout_secs {
            config.http_timeout_secs = secs;
        }
        config.dry_run |= self.dry_run;

        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseArgs {
    pub file: PathBuf,
    pub lang: String,
    pub rules_dir: PathBuf,
    pub story_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(RunArgs),
    Parse(ParseArgs),
    Help,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub command: Command,
    pub verbose: bool,
}

fn take_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{} requires a value", flag))
}

fn take_number<T: std::str::FromStr>(args: &[String], i: &mut usize, flag: &str) -> Result<T> {
    let raw = take_value(args, i, flag)?;
    raw.parse()
        .map_err(|_| anyhow!("{} expects a number, got '{}'", flag, raw))
}

/// `args` excludes the program name.
pub fn parse_args(args: &[String]) -> Result<CliArgs> {
    let verbose = args.iter().any(|a| a == "-v" || a == "--verbose");
    if args.iter().any(|a| a == "-h" || a == "--help") {
        return Ok(CliArgs {
            command: Command::Help,
            verbose,
        });
    }

    let command = if args.first().map(String::as_str) == Some("parse") {
        Command::Parse(parse_parse_args(&args[1..])?)
    } else {
        Command::Run(parse_run_args(args)?)
    };
    Ok(CliArgs { command, verbose })
}

fn parse_run_args(args: &[String]) -> Result<RunArgs> {
    let mut run = RunArgs::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--config" | "-c" => run.config = Some(PathBuf::from(take_value(args, &mut i, flag)?)),
            "--data-dir" | "-d" => {
                run.data_dir = Some(PathBuf::from(take_value(args, &mut i, flag)?))
            }
            "--output-dir" | "-o" => {
                run.output_dir = Some(PathBuf::from(take_value(args, &mut i, flag)?))
            }
            "--rules-dir" | "-r" => {
                run.rules_dir = Some(PathBuf::from(take_value(args, &mut i, flag)?))
            }
            "--lang" | "-l" => run.languages.push(take_value(args, &mut i, flag)?.to_string()),
            "--master" => run.master_language = Some(take_value(args, &mut i, flag)?.to_string()),
            "--workers" | "-w" => run.workers = Some(take_number(args, &mut i, flag)?),
            "--check-images" => run.check_images = true,
            "--image-url" => run.image_url = Some(take_value(args, &mut i, flag)?.to_string()),
            "--image-workers" => run.image_workers = Some(take_number(args, &mut i, flag)?),
            "--max-scans" => run.max_scans = Some(take_number(args, &mut i, flag)?),
            "--force-scan" => run.force_scan = true,
            "--story-review" => {
                run.story_review = Some(take_value(args, &mut i, flag)?.to_string())
            }
            "--timeout" => run.timeout_secs = Some(take_number(args, &mut i, flag)?),
            "--dry-run" => run.dry_run = true,
            "--verbose" | "-v" => {}
            other => bail!("unknown argument: {}", other),
        }
        i += 1;
    }
    Ok(run)
}

fn parse_parse_args(args: &[String]) -> Result<ParseArgs> {
    let mut file = None;
    let mut lang = PipelineConfig::default().master_language;
    let mut rules_dir = PipelineConfig::default().rules_dir;
    let mut story_id = None;

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--lang" | "-l" => lang = take_value(args, &mut i, flag)?.to_string(),
            "--rules-dir" | "-r" => rules_dir = PathBuf::from(take_value(args, &mut i, flag)?),
            "--id" => story_id = Some(take_value(args, &mut i, flag)?.to_string()),
            "--verbose" | "-v" => {}
            other if other.starts_with('-') => bail!("unknown argument: {}", other),
            other => {
                if file.is_some() {
                    bail!("parse takes a single file, got extra '{}'", other);
                }
                file = Some(PathBuf::from(other));
            }
        }
        i += 1;
    }

    Ok(ParseArgs {
        file: file.ok_or_else(|| anyhow!("parse requires a <FILE>"))?,
        lang,
        rules_dir,
        story_id,
    })
}

fn default_story_id(file: &Path) -> String {
    file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.display().to_string())
}

/// 解析单个剧本并以 JSON 输出，用于排查归属问题
pub fn run_parse(args: &ParseArgs) -> Result<String> {
    let rules = RuleCache::new(&args.rules_dir);
    let global = rules.global()?;
    let lang_rules = rules.language(&args.lang)?;
    let text = DataService::read_story_text(&args.file)?;
    let story_id = args
        .story_id
        .clone()
        .unwrap_or_else(|| default_story_id(&args.file));

    let results = parse_story_cast(&text, &story_id, &args.lang, &global, &lang_rules);
    Ok(serde_json::to_string_pretty(&results)?)
}

pub fn execute(command: Command) -> Result<()> {
    match command {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Parse(args) => {
            println!("{}", run_parse(&args)?);
            Ok(())
        }
        Command::Run(args) => {
            let config = args.into_config()?;
            log::info!(
                "[SYNC] data={} output={} languages={:?} workers={}",
                config.data_dir.display(),
                config.output_dir.display(),
                config.ordered_languages(),
                config.workers
            );
            let rules = RuleCache::new(&config.rules_dir);
            let pipeline = Pipeline::new(&config, &rules)?;
            for summary in pipeline.run_all()? {
                log::info!(
                    "[SYNC] {}: {} files, {} characters, {} scanned, {} search entries",
                    summary.lang,
                    summary.story_files,
                    summary.characters,
                    summary.scanned,
                    summary.report.search_entries
                );
            }
            Ok(())
        }
    }
}
