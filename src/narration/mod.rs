//! Long-form narration: one LLM call per segment prompt, repair attempts, then fusion.

pub mod generator;
pub mod parse;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{error, info, warn};

pub use generator::{SegmentGenerator, SegmentResult, generate_episode};

use crate::args::NarrateArgs;
use crate::cache::JsonCache;
use crate::config::{AnthropicSettings, AppConfig, require_api_key};
use crate::error::PipelineError;
use crate::events::{Event, emit};
use crate::llm::{AnthropicClient, ChatModel, RetryPolicy, UsageMonitor};
use crate::paths::{PathResolver, Stage, default_allowed_roots, resolve_topic_dir, sanitize_path};

pub const CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

static EXEC_PROMPT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^msp_(\d+)_execution\.txt$").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NarrationConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_attempts: u32,
    pub word_tolerance_percent: u32,
    pub rate_limit_delay: Duration,
    pub max_parallel_segments: usize,
    pub enable_cache: bool,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self::from_settings(&AnthropicSettings::default())
    }
}

impl NarrationConfig {
    pub fn from_settings(s: &AnthropicSettings) -> Self {
        Self {
            model: s.model.clone(),
            temperature: s.temperature,
            max_tokens: s.max_tokens,
            max_attempts: s.max_attempts.max(1),
            word_tolerance_percent: s.word_tolerance_percent,
            rate_limit_delay: Duration::from_secs_f64(s.rate_limit_delay_secs.max(0.0)),
            max_parallel_segments: s.max_parallel_segments.max(1),
            enable_cache: true,
        }
    }
}

/// Episode prompt directories (`ep*`) under `<prompts_root>/<topic>/<LANG>`, sorted by name.
pub fn find_episodes(lang_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(lang_dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter(|p| p.file_name().is_some_and(|n| n.to_string_lossy().to_lowercase().starts_with("ep")))
        .collect();
    dirs.sort();
    dirs
}

/// Number of `segment_*.txt` files already written for an episode.
pub fn count_segments(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with("segment_") && name.ends_with(".txt")
        })
        .count()
}

fn needs_retry(ep_dir: &Path, output_base: &Path) -> bool {
    let expected = match generator::load_plan(ep_dir) {
        Ok(plan) => plan.segments_total as usize,
        Err(e) => {
            warn!("{:#}", e);
            return true;
        }
    };
    count_segments(&generator::episode_output_dir(ep_dir, output_base)) < expected
}

/// Regenerates a single segment from its execution prompt file.
pub async fn generate_single(generator: &SegmentGenerator, prompt_file: &Path, output_base: &Path) -> Result<SegmentResult> {
    let name = prompt_file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let index: u32 = EXEC_PROMPT
        .captures(&name)
        .and_then(|c| c[1].parse().ok())
        .ok_or_else(|| PipelineError::Validation(format!("not an execution prompt: {}", prompt_file.display())))?;
    let prompts_dir = prompt_file.parent().unwrap_or(Path::new("."));
    let ep_dir = prompts_dir.parent().unwrap_or(prompts_dir);
    let plan = generator::load_plan(ep_dir)?;
    let seg = plan
        .segments
        .iter()
        .find(|s| s.segment_index == index)
        .ok_or_else(|| PipelineError::Validation(format!("segment {index} not in episode context")))?;
    let series = ep_dir
        .parent()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let result = generator.process_segment(seg, prompts_dir, &series).await;
    if !result.final_text.is_empty() {
        let out = generator::episode_output_dir(ep_dir, output_base).join(format!("segment_{index:02}.txt"));
        generator::save_with_backup(&out, &result.final_text).with_context(|| format!("writing {}", out.display()))?;
        emit(Event::OutputPath { value: out.display().to_string() });
    }
    Ok(result)
}

#[derive(Debug, Serialize)]
struct SessionSummary<'a> {
    timestamp: String,
    total_episodes: usize,
    successful_episodes: usize,
    failed_episodes: Vec<String>,
    episodes_processed: Vec<String>,
    config: &'a NarrationConfig,
    performance_metrics: crate::llm::monitor::MonitorStats,
}

fn dir_name(p: &Path) -> String {
    p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Segment cache under `<output_base>/.cache/segments`, with expired entries removed.
fn open_segment_cache(output_base: &Path) -> JsonCache {
    let cache = JsonCache::new(output_base.join(".cache").join("segments"), Some(CACHE_TTL));
    let removed = cache.clear_older_than(CACHE_TTL);
    if removed > 0 {
        info!("Removed {} expired cache entries", removed);
    }
    let stats = cache.stats();
    info!("segment cache {}: {} entries, {} bytes", cache.dir().display(), stats.entries, stats.bytes);
    cache
}

pub async fn run(args: &NarrateArgs, app: &AppConfig) -> Result<()> {
    emit(Event::phase("start"));
    let allowed = default_allowed_roots();
    let prompts_root = args.prompts_root.clone().unwrap_or_else(|| PathResolver::root(Stage::Prompts));
    let output_base = sanitize_path(
        &args.output_root.clone().unwrap_or_else(|| PathResolver::root(Stage::Narration)),
        &allowed,
    )?;

    let mut config = NarrationConfig::from_settings(&app.anthropic);
    config.enable_cache = !args.no_cache;
    let client = AnthropicClient::new(&app.anthropic, require_api_key("ANTHROPIC_API_KEY")?)?
        .with_retry_policy(RetryPolicy::narration());
    let model: Arc<dyn ChatModel> = Arc::new(client);
    let cache = config.enable_cache.then(|| open_segment_cache(&output_base));
    let monitor = Arc::new(UsageMonitor::new());
    let generator = SegmentGenerator::new(model, config.clone(), cache, monitor.clone());

    if let Some(prompt_file) = &args.prompt_file {
        let prompt_file = sanitize_path(prompt_file, &allowed)?;
        emit(Event::phase("generating"));
        let result = generate_single(&generator, &prompt_file, &output_base).await?;
        monitor.log_summary();
        if !result.status.has_text() {
            return Err(PipelineError::Provider(
                result.error_message.unwrap_or_else(|| format!("segment {} failed", result.segment_index)),
            )
            .into());
        }
        emit(Event::Done);
        return Ok(());
    }

    let topic = args
        .topic
        .as_deref()
        .ok_or_else(|| PipelineError::Validation("--topic is required unless --prompt-file is given".to_string()))?;
    let lang_dir = resolve_topic_dir(&prompts_root, topic).join(args.language.code());
    let lang_dir = sanitize_path(&lang_dir, &allowed)?;
    let mut episodes = find_episodes(&lang_dir);
    if !args.episodes.is_empty() {
        episodes.retain(|p| args.episodes.iter().any(|e| e.eq_ignore_ascii_case(&dir_name(p))));
    }
    if args.retry_failed {
        episodes.retain(|p| needs_retry(p, &output_base));
    }
    if episodes.is_empty() {
        return Err(PipelineError::Validation(format!("no episodes to process in {}", lang_dir.display())).into());
    }
    info!(
        "Generating {} episode(s) of {} ({}): {}",
        episodes.len(),
        topic,
        args.language,
        episodes.iter().map(|p| dir_name(p)).collect::<Vec<_>>().join(", ")
    );

    emit(Event::phase("generating"));
    let mut successful = 0;
    let mut failed = Vec::new();
    for ep in &episodes {
        match generate_episode(&generator, ep, &output_base).await {
            Ok(log) if log.successful_segments > 0 => {
                successful += 1;
                emit(Event::OutputPath { value: generator::episode_output_dir(ep, &output_base).display().to_string() });
            }
            Ok(_) => {
                emit(Event::Warn { message: format!("{}: no segment produced text", dir_name(ep)) });
                failed.push(dir_name(ep));
            }
            Err(e) => {
                error!("Episode {} failed: {:#}", dir_name(ep), e);
                emit(Event::error("episode-failed", format!("{}: {e:#}", dir_name(ep))));
                failed.push(dir_name(ep));
            }
        }
    }

    monitor.log_summary();
    let summary = SessionSummary {
        timestamp: chrono::Local::now().to_rfc3339(),
        total_episodes: episodes.len(),
        successful_episodes: successful,
        failed_episodes: failed.clone(),
        episodes_processed: episodes.iter().map(|p| dir_name(p)).collect(),
        config: &config,
        performance_metrics: monitor.stats(),
    };
    let summary_path = output_base
        .join("summaries")
        .join(format!("session_{}.json", chrono::Local::now().format("%Y%m%d_%H%M%S")));
    if let Err(e) = write_json(&summary_path, &summary) {
        warn!("could not save session summary: {:#}", e);
    }

    info!("Processed {}/{} episodes", successful, episodes.len());
    if successful == 0 {
        return Err(PipelineError::Provider(format!("no episode produced narration: {}", failed.join(", "))).into());
    }
    emit(Event::Done);
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_from_settings() {
        let s = AnthropicSettings { rate_limit_delay_secs: 1.5, max_parallel_segments: 0, ..AnthropicSettings::default() };
        let c = NarrationConfig::from_settings(&s);
        assert_eq!(c.rate_limit_delay, Duration::from_millis(1500));
        assert_eq!(c.max_parallel_segments, 1);
        assert_eq!(c.max_tokens, 8000);
        assert!(c.enable_cache);
    }

    #[test]
    fn episodes_and_segment_counts() {
        let tmp = TempDir::new().unwrap();
        for name in ["ep02", "ep01", "meta", "EP03"] {
            fs::create_dir_all(tmp.path().join(name)).unwrap();
        }
        let names: Vec<String> = find_episodes(tmp.path()).iter().map(|p| dir_name(p)).collect();
        assert_eq!(names, vec!["EP03", "ep01", "ep02"]);

        let out = tmp.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("segment_01.txt"), "a").unwrap();
        fs::write(out.join("segment_01.txt.bak_20250101_000000"), "a").unwrap();
        fs::write(out.join("generation_log.json"), "{}").unwrap();
        assert_eq!(count_segments(&out), 1);
    }

    #[test]
    fn segment_cache_drops_expired_entries_on_open() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(".cache").join("segments");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("old.json"), r#"{"created_at":"2000-01-01T00:00:00Z","value":"stale"}"#).unwrap();
        fs::write(dir.join("broken.json"), "not json").unwrap();

        let cache = open_segment_cache(tmp.path());
        assert_eq!(cache.dir(), dir.as_path());
        assert_eq!(cache.stats().entries, 0);
        cache.store("fresh", &"text".to_string());
        assert_eq!(cache.stats().entries, 1);
        assert!(cache.stats().bytes > 0);
    }
}
