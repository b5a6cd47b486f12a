//! Text post-processing for narration segments.
//!
//! File mode runs each segment through a preset, optional regex rules and the
//! offline formatter, writing a `.meta.json` sidecar next to every output.
//! The sidecar also carries the formatter warnings and the segment quality
//! verdict so weak segments can be found without rereading them.
//! Episode mode merges the segments of one episode instead.

pub mod episode;
pub mod presets;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub use episode::{EpisodeOptions, EpisodeOutcome, EpisodeWriters, process_episode_dir};
pub use presets::{Preset, RuleSet};

use crate::args::PostprocessArgs;
use crate::cache::sha256_hex;
use crate::config::{AppConfig, require_api_key};
use crate::error::PipelineError;
use crate::events::{Event, emit};
use crate::lang::Language;
use crate::llm::{ChatModel, OpenAiClient, RetryPolicy};
use crate::manifest::utc_timestamp;
use crate::narration_core::{
    FormatterConfig, GeneratorConfig, NarrationCache, SegmentQualityValidator, TextFormatter,
};
use crate::paths::{PathResolver, Stage, derive_episode_location};

pub const PROCESSOR_VERSION: &str = "historical_processor_v1";

/// Segment files for an input path: the file itself, `<dir>/narration/*.txt`,
/// the dir when it is a `narration` dir, the first nested `narration` dir, or
/// the dir's own `*.txt`.
pub fn collect_txt_files(input: &Path) -> Vec<PathBuf> {
    if input.is_file() {
        return vec![input.to_path_buf()];
    }
    let scan_dir = if input.join("narration").is_dir() {
        input.join("narration")
    } else if input.file_name().is_some_and(|n| n == "narration") {
        input.to_path_buf()
    } else {
        WalkDir::new(input)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .find(|e| e.file_type().is_dir() && e.file_name() == "narration")
            .map(|e| e.into_path())
            .unwrap_or_else(|| input.to_path_buf())
    };
    let Ok(entries) = fs::read_dir(&scan_dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|x| x == "txt"))
        .collect();
    files.sort();
    files
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMeta {
    pub source_path: String,
    pub source_sha256: String,
    pub processor_version: &'static str,
    pub preset: &'static str,
    pub rules: Option<String>,
    pub timestamp: String,
    pub language: String,
    pub topic: String,
    pub episode: String,
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReport>,
}

/// Formatter and validator findings for one processed segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub ok: bool,
    pub issues: Vec<String>,
    pub formatter_warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub text: String,
    /// None when the language is unknown and the formatter did not run.
    pub quality: Option<QualityReport>,
}

/// Preset, then rules, then the offline formatter and the segment validator
/// when the language is known.
pub fn transform(text: &str, preset: Preset, rules: &RuleSet, lang: Option<Language>) -> Transformed {
    let processed = preset.apply(text, lang.unwrap_or(Language::Cs));
    let processed = if rules.is_empty() { processed } else { rules.apply(&processed) };
    let Some(l) = lang else {
        return Transformed { text: processed, quality: None };
    };
    let mut formatter = TextFormatter::new(FormatterConfig::offline(l));
    let text = formatter.format(&processed);
    let verdict = SegmentQualityValidator::new(l).validate(&text);
    let quality = QualityReport {
        ok: verdict.ok,
        issues: verdict.reasons,
        formatter_warnings: formatter.warnings().to_vec(),
    };
    Transformed { text, quality: Some(quality) }
}

fn absolute(p: &Path) -> String {
    fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf()).display().to_string()
}

/// Processes one segment file into `<out_base>/<topic>/<lang>/<ep>/<name>`.
/// A dry run writes the text to a temporary file instead and reports it in `temp_path`.
pub fn process_file(in_path: &Path, out_base: &Path, rules: &RuleSet, preset: Preset, dry_run: bool) -> Result<FileMeta> {
    let bytes = fs::read(in_path).with_context(|| format!("reading {}", in_path.display()))?;
    let src = String::from_utf8_lossy(&bytes).into_owned();
    let loc = derive_episode_location(in_path.parent().unwrap_or(Path::new(".")));
    let lang = loc.lang.parse::<Language>().ok();
    if lang.is_none() {
        debug!("{}: unknown language {:?}, skipping formatter", in_path.display(), loc.lang);
    }
    let Transformed { text: processed, quality } = transform(&src, preset, rules, lang);
    if let Some(q) = quality.as_ref().filter(|q| !q.ok) {
        warn!("{}: quality issues: {}", in_path.display(), q.issues.join(", "));
    }

    let name = in_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "segment.txt".into());
    let out_dir = out_base.join(&loc.topic).join(&loc.lang).join(&loc.episode);
    let out_file = out_dir.join(&name);
    let mut meta = FileMeta {
        source_path: absolute(in_path),
        source_sha256: sha256_hex(src.as_bytes()),
        processor_version: PROCESSOR_VERSION,
        preset: preset.as_str(),
        rules: rules.name.clone(),
        timestamp: utc_timestamp(),
        language: loc.lang.clone(),
        topic: loc.topic.clone(),
        episode: loc.episode.clone(),
        output_path: None,
        output_sha256: None,
        temp_path: None,
        quality,
    };

    if dry_run {
        let temp = std::env::temp_dir().join(format!("postprocess_{}_{}", &meta.source_sha256[..12], name));
        fs::write(&temp, &processed).with_context(|| format!("writing {}", temp.display()))?;
        info!("dry run: {} -> {}", in_path.display(), temp.display());
        meta.temp_path = Some(temp.display().to_string());
        return Ok(meta);
    }

    fs::create_dir_all(&out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    fs::write(&out_file, &processed).with_context(|| format!("writing {}", out_file.display()))?;
    meta.output_path = Some(absolute(&out_file));
    meta.output_sha256 = Some(sha256_hex(processed.as_bytes()));
    let meta_path = out_dir.join(format!("{name}.meta.json"));
    fs::write(&meta_path, serde_json::to_string_pretty(&meta)?)
        .with_context(|| format!("writing {}", meta_path.display()))?;
    info!("processed {} ({}/{}/{})", out_file.display(), loc.topic, loc.lang, loc.episode);
    Ok(meta)
}

/// Runs `process_file` over `files` with at most `concurrency` files in flight.
/// Results come back in input order.
pub async fn process_files(
    files: Vec<PathBuf>,
    out_base: &Path,
    rules: Arc<RuleSet>,
    preset: Preset,
    dry_run: bool,
    concurrency: usize,
) -> Result<Vec<Result<FileMeta>>> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    for (i, file) in files.into_iter().enumerate() {
        let permit = semaphore.clone().acquire_owned().await?;
        let out_base = out_base.to_path_buf();
        let rules = rules.clone();
        set.spawn_blocking(move || {
            let _permit = permit;
            (i, process_file(&file, &out_base, &rules, preset, dry_run).with_context(|| file.display().to_string()))
        });
    }
    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        results.push(joined?);
    }
    results.sort_by_key(|(i, _)| *i);
    Ok(results.into_iter().map(|(_, r)| r).collect())
}

fn writers_for(app: &AppConfig) -> Result<EpisodeWriters> {
    let client = OpenAiClient::new(&app.openai, require_api_key("OPENAI_API_KEY")?)?
        .with_retry_policy(RetryPolicy::build());
    let model: Arc<dyn ChatModel> = Arc::new(client);
    Ok(EpisodeWriters {
        model,
        generator: GeneratorConfig { model: app.openai.model.clone(), ..GeneratorConfig::default() },
        cache: NarrationCache::new(),
    })
}

pub async fn run(args: &PostprocessArgs, app: &AppConfig) -> Result<()> {
    emit(Event::phase("start"));
    let out_base = args
        .output_dir
        .clone()
        .or_else(|| app.postprocess.output_base.clone())
        .unwrap_or_else(|| PathResolver::root(Stage::Postprocess));
    fs::create_dir_all(&out_base)
        .map_err(|e| PipelineError::Io(format!("cannot create {}: {e}", out_base.display())))?;

    let rules = match &args.rules {
        Some(p) => RuleSet::load(p)?,
        None => RuleSet::default(),
    };

    let files = match (&args.input_file, &args.input_dir) {
        (Some(file), _) => {
            if !file.is_file() {
                return Err(PipelineError::Io(format!("input file not found: {}", file.display())).into());
            }
            vec![file.clone()]
        }
        (None, Some(dir)) => {
            if !dir.is_dir() {
                return Err(PipelineError::Io(format!("input directory not found: {}", dir.display())).into());
            }
            if args.episode_mode {
                return run_episode(args, app, dir, &out_base).await;
            }
            collect_txt_files(dir)
        }
        (None, None) => return Err(PipelineError::Validation("--input-file or --input-dir is required".into()).into()),
    };
    if files.is_empty() {
        return Err(PipelineError::Io("no input files found".into()).into());
    }

    let concurrency = args.concurrency.unwrap_or(app.postprocess.concurrency);
    info!("post-processing {} file(s) with preset {} (concurrency {})", files.len(), args.preset.as_str(), concurrency);
    emit(Event::phase("processing"));
    let total = files.len();
    let results = process_files(files, &out_base, Arc::new(rules), args.preset, args.dry_run, concurrency).await?;

    let mut failed = 0;
    for result in results {
        match result {
            Ok(meta) => {
                if let Some(p) = meta.output_path.or(meta.temp_path) {
                    emit(Event::OutputPath { value: p });
                }
            }
            Err(e) => {
                failed += 1;
                error!("segment failed: {:#}", e);
                emit(Event::error("segment-failed", format!("{e:#}")));
            }
        }
    }
    if failed > 0 {
        return Err(anyhow!("{failed} of {total} files failed"));
    }
    emit(Event::Done);
    Ok(())
}

async fn run_episode(args: &PostprocessArgs, app: &AppConfig, dir: &Path, out_base: &Path) -> Result<()> {
    let opts = EpisodeOptions {
        use_gpt: args.use_gpt,
        prefer_existing: !args.no_prefer_existing,
        force_rebuild: args.force_rebuild,
        save_merged: !args.no_save_merged,
    };
    let writers = if args.use_gpt { Some(writers_for(app)?) } else { None };
    emit(Event::phase("episode"));
    let narration_root = PathResolver::outputs_base().join(Stage::Narration.subdir());
    match process_episode_dir(dir, out_base, &narration_root, opts, writers.as_ref()).await? {
        EpisodeOutcome::Reused(p) | EpisodeOutcome::Merged(Some(p)) => {
            emit(Event::OutputPath { value: p.display().to_string() });
        }
        EpisodeOutcome::Merged(None) => info!("merged episode not saved (--no-save-merged)"),
    }
    emit(Event::Done);
    Ok(())
}
