use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::NarrationConfig;
use super::parse::{Validation, check_requirements, count_words, extract_narration, parse_validation};
use crate::cache::{JsonCache, key_for_text};
use crate::llm::{ChatModel, ChatRequest, LlmError, UsageMonitor};
use crate::paths::sanitize_filename;
use crate::prompts::{EpisodePlan, SegmentPlan};

const EXTRA_INSTRUCTION: &str =
    "Ensure the output meets the full target word count. Extend narrative depth where needed.";
const SEGMENT_SEPARATOR: &str = "\n\n---SEGMENT---\n\n";
const MIN_SEGMENTS_FOR_FUSION: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Success,
    Warning,
    Failed,
    Error,
    Cached,
}

impl GenerationStatus {
    pub fn has_text(self) -> bool {
        matches!(self, GenerationStatus::Success | GenerationStatus::Warning | GenerationStatus::Cached)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wordcount: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentResult {
    pub segment_index: u32,
    pub attempts: Vec<AttemptRecord>,
    #[serde(skip)]
    pub final_text: String,
    pub final_wordcount: usize,
    pub status: GenerationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<Validation>,
    pub from_cache: bool,
    pub generation_time: f64,
    pub error_message: Option<String>,
}

impl SegmentResult {
    fn empty(segment_index: u32, status: GenerationStatus, message: impl Into<String>) -> Self {
        Self {
            segment_index,
            attempts: Vec::new(),
            final_text: String::new(),
            final_wordcount: 0,
            status,
            validation: None,
            from_cache: false,
            generation_time: 0.0,
            error_message: Some(message.into()),
        }
    }
}

struct Candidate {
    text: String,
    full_text: String,
    wordcount: usize,
    validation: Option<Validation>,
    issues: Vec<String>,
}

impl Candidate {
    fn passed(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Prompt for a repair attempt built from the fix template and the best reply so far.
pub fn fix_prompt(fix_template: &str, previous_full: &str, issues: &[String]) -> String {
    let issue_list = issues.iter().map(|i| format!("- {i}")).collect::<Vec<_>>().join("\n");
    let prompt = fix_template.replace("{ISSUE_LIST}", &issue_list);
    let prompt = format!("Previous output:\n{previous_full}\n\n{prompt}");
    if prompt.contains(EXTRA_INSTRUCTION) {
        prompt
    } else {
        format!("{EXTRA_INSTRUCTION}\n\n{prompt}")
    }
}

pub fn topic_prefix(series: &str) -> String {
    format!(
        "ONLY write about {}. Do NOT include unrelated topics. If you cannot produce content exclusively about this topic, respond with an empty narration and a validation block.\n\n",
        series.replace('_', " ")
    )
}

pub fn fusion_prompt(instructions: &str, segments: &[&str]) -> String {
    format!("{instructions}\n\nSEGMENTS TO FUSE:\n\n{}", segments.join(SEGMENT_SEPARATOR))
}

/// Writes `content`, renaming an existing file to `<name>.bak_<timestamp>` first.
pub fn save_with_backup(path: &Path, content: &str) -> std::io::Result<()> {
    if path.exists() {
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let backup = path.with_file_name(format!("{name}.bak_{}", chrono::Local::now().format("%Y%m%d_%H%M%S")));
        match fs::rename(path, &backup) {
            Ok(()) => debug!("backup created: {}", backup.display()),
            Err(e) => warn!("could not create backup {}: {}", backup.display(), e),
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

/// Generates narration segments against one chat model, with repair attempts and a reply cache.
#[derive(Clone)]
pub struct SegmentGenerator {
    model: Arc<dyn ChatModel>,
    config: NarrationConfig,
    cache: Option<JsonCache>,
    monitor: Arc<UsageMonitor>,
}

impl SegmentGenerator {
    pub fn new(model: Arc<dyn ChatModel>, config: NarrationConfig, cache: Option<JsonCache>, monitor: Arc<UsageMonitor>) -> Self {
        Self { model, config, cache, monitor }
    }

    fn cache_key(&self, prompt: &str) -> String {
        let params = serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });
        key_for_text(&[prompt, &params.to_string()])
    }

    /// A cached reply only counts when it still meets the target.
    fn cached_reply(&self, prompt: &str, target: u32) -> Option<String> {
        let cache = self.cache.as_ref()?;
        let Some(full) = cache.load::<String>(&self.cache_key(prompt)) else {
            self.monitor.record_cache_miss();
            return None;
        };
        let issues = check_requirements(
            &extract_narration(&full),
            parse_validation(&full).as_ref(),
            target,
            self.config.word_tolerance_percent,
        );
        if issues.is_empty() {
            self.monitor.record_cache_hit();
            info!("    using cached segment (validated)");
            Some(full)
        } else {
            debug!("cached reply fails target {}: {:?}", target, issues);
            self.monitor.record_cache_miss();
            None
        }
    }

    async fn call(&self, prompt: &str) -> Result<String, LlmError> {
        if !self.config.rate_limit_delay.is_zero() {
            tokio::time::sleep(self.config.rate_limit_delay).await;
        }
        let req = ChatRequest::new(&self.config.model)
            .temperature(self.config.temperature)
            .max_tokens(self.config.max_tokens)
            .user(prompt);
        let started = Instant::now();
        match self.model.chat(&req).await {
            Ok(res) => {
                self.monitor.record_call(&res.model, res.total_tokens(), res.latency, true);
                debug!("{} answered in {:.2}s", self.model.name(), res.latency.as_secs_f64());
                if res.text.trim().is_empty() { Err(LlmError::EmptyResponse) } else { Ok(res.text) }
            }
            Err(e) => {
                self.monitor.record_call(&self.config.model, 0, started.elapsed(), false);
                Err(e)
            }
        }
    }

    pub async fn generate_segment(
        &self,
        prompt: &str,
        fix_template: &str,
        segment_index: u32,
        target: u32,
        series: Option<&str>,
    ) -> SegmentResult {
        let started = Instant::now();
        let mut attempts = Vec::new();
        let mut best: Option<Candidate> = None;
        let mut from_cache = false;
        let mut last_error = None;

        for attempt in 1..=self.config.max_attempts {
            info!("  segment {} attempt {}/{}", segment_index, attempt, self.config.max_attempts);
            let mut current = match &best {
                Some(b) if attempt > 1 && !fix_template.is_empty() => fix_prompt(fix_template, &b.full_text, &b.issues),
                _ => prompt.to_string(),
            };
            if attempt > 1 {
                if let Some(series) = series.filter(|s| !s.is_empty()) {
                    current = format!("{}{}", topic_prefix(series), current);
                }
            }

            let (full_text, cached) = match self.cached_reply(&current, target) {
                Some(text) => (text, true),
                None => match self.call(&current).await {
                    Ok(text) => (text, false),
                    Err(e) => {
                        error!("    API error: {}", e);
                        attempts.push(AttemptRecord {
                            attempt,
                            status: "error".to_string(),
                            wordcount: None,
                            issues: Vec::new(),
                            error: Some(e.to_string()),
                        });
                        last_error = Some(e.to_string());
                        break;
                    }
                },
            };

            let text = extract_narration(&full_text);
            let validation = parse_validation(&full_text);
            let wordcount = count_words(&text);
            let issues = check_requirements(&text, validation.as_ref(), target, self.config.word_tolerance_percent);
            let candidate = Candidate { text, full_text, wordcount, validation, issues };
            attempts.push(AttemptRecord {
                attempt,
                status: if candidate.passed() { "success" } else { "failed" }.to_string(),
                wordcount: Some(wordcount),
                issues: candidate.issues.clone(),
                error: None,
            });

            let passed = candidate.passed();
            let issue_text = candidate.issues.join(", ");
            let score = wordcount.abs_diff(target as usize);
            if best.as_ref().is_none_or(|b| score < b.wordcount.abs_diff(target as usize)) {
                if passed && !cached {
                    if let Some(cache) = &self.cache {
                        cache.store(&self.cache_key(&current), &candidate.full_text);
                    }
                }
                from_cache = cached;
                best = Some(candidate);
            }
            if passed {
                info!("    ok: {} words", wordcount);
                break;
            }
            warn!("    issues: {}", issue_text);
        }

        let generation_time = started.elapsed().as_secs_f64();
        match best {
            Some(b) => {
                let status = match (b.passed(), from_cache) {
                    (true, true) => GenerationStatus::Cached,
                    (true, false) => GenerationStatus::Success,
                    (false, _) => GenerationStatus::Warning,
                };
                SegmentResult {
                    segment_index,
                    attempts,
                    final_wordcount: b.wordcount,
                    final_text: b.text,
                    status,
                    validation: b.validation,
                    from_cache,
                    generation_time,
                    error_message: None,
                }
            }
            None => {
                let (status, message) = match last_error {
                    Some(e) => (GenerationStatus::Error, e),
                    None => (GenerationStatus::Failed, "no text was generated".to_string()),
                };
                SegmentResult { attempts, generation_time, ..SegmentResult::empty(segment_index, status, message) }
            }
        }
    }

    pub async fn generate_fusion(&self, instructions: &str, segments: &[&str]) -> Option<String> {
        info!("Fusing {} segments", segments.len());
        match self.call(&fusion_prompt(instructions, segments)).await {
            Ok(text) => Some(text.trim().to_string()),
            Err(e) => {
                error!("fusion failed: {}", e);
                None
            }
        }
    }

    /// Runs one segment from its prompt files in `prompts_dir`.
    pub async fn process_segment(&self, seg: &SegmentPlan, prompts_dir: &Path, series: &str) -> SegmentResult {
        let label: String = seg.msp_label.chars().take(50).collect();
        info!("Segment {}: {}", seg.segment_index, label);
        let exec_file = prompts_dir.join(format!("msp_{:02}_execution.txt", seg.segment_index));
        let fix_file = prompts_dir.join(format!("msp_{:02}_fix_template.txt", seg.segment_index));

        let prompt = match fs::read_to_string(&exec_file) {
            Ok(p) => p,
            Err(e) => {
                return SegmentResult::empty(
                    seg.segment_index,
                    GenerationStatus::Failed,
                    format!("missing execution prompt {}: {e}", exec_file.display()),
                );
            }
        };
        let fix_template = fs::read_to_string(&fix_file).unwrap_or_default();

        let token = series.replace('_', " ").to_lowercase();
        if !token.is_empty() && !prompt.to_lowercase().contains(&token) && !fix_template.to_lowercase().contains(&token) {
            warn!("possible topic mismatch: series {:?} not mentioned in {}", series, exec_file.display());
        }
        self.generate_segment(&prompt, &fix_template, seg.segment_index, seg.word_target, Some(series)).await
    }

    /// Runs segments with at most `max_parallel_segments` in flight, results in segment order.
    pub async fn generate_segments(&self, segments: &[SegmentPlan], prompts_dir: &Path, series: &str) -> Vec<SegmentResult> {
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_segments.max(1)));
        let mut set = JoinSet::new();
        for seg in segments.iter().cloned() {
            let this = self.clone();
            let permits = permits.clone();
            let prompts_dir = prompts_dir.to_path_buf();
            let series = series.to_string();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                this.process_segment(&seg, &prompts_dir, &series).await
            });
        }

        let mut results = Vec::with_capacity(segments.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(r) => results.push(r),
                Err(e) => error!("segment task failed: {}", e),
            }
        }
        for seg in segments {
            if !results.iter().any(|r| r.segment_index == seg.segment_index) {
                results.push(SegmentResult::empty(seg.segment_index, GenerationStatus::Error, "segment task aborted"));
            }
        }
        results.sort_by_key(|r| r.segment_index);
        results
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationLog {
    pub episode: String,
    pub timestamp: String,
    pub segments: Vec<SegmentResult>,
    pub total_words: usize,
    pub successful_segments: usize,
    pub total_segments: usize,
    pub fusion_generated: bool,
    pub status: String,
    pub total_generation_time: f64,
    pub cache_hits: usize,
}

/// Output directory for an episode prompt dir laid out as `<topic>/<lang>/<ep>`.
pub fn episode_output_dir(ep_dir: &Path, output_base: &Path) -> PathBuf {
    let name = |p: Option<&Path>| {
        p.and_then(Path::file_name).map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    };
    let lang_dir = ep_dir.parent();
    let topic_dir = lang_dir.and_then(Path::parent);
    output_base
        .join(sanitize_filename(&name(topic_dir)))
        .join(name(lang_dir))
        .join(name(Some(ep_dir)))
}

pub fn load_plan(ep_dir: &Path) -> Result<EpisodePlan> {
    let context_file = ep_dir.join("meta").join("episode_context.json");
    let raw = fs::read_to_string(&context_file).with_context(|| format!("reading {}", context_file.display()))?;
    let plan: EpisodePlan =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", context_file.display()))?;
    Ok(plan)
}

/// Generates every segment of one episode, fuses them and writes the generation log.
pub async fn generate_episode(generator: &SegmentGenerator, ep_dir: &Path, output_base: &Path) -> Result<GenerationLog> {
    let episode = ep_dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    info!("Processing episode {}", episode);
    let plan = load_plan(ep_dir)?;
    let prompts_dir = ep_dir.join("prompts");
    let series = ep_dir
        .parent()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let output_dir = episode_output_dir(ep_dir, output_base);
    fs::create_dir_all(&output_dir).with_context(|| format!("creating {}", output_dir.display()))?;

    let results = generator.generate_segments(&plan.segments, &prompts_dir, &series).await;
    let successful = results.iter().filter(|r| r.status.has_text()).count();

    for r in results.iter().filter(|r| !r.final_text.is_empty()) {
        let path = output_dir.join(format!("segment_{:02}.txt", r.segment_index));
        save_with_backup(&path, &r.final_text).with_context(|| format!("writing {}", path.display()))?;
    }

    let mut fusion_generated = false;
    let fusion_file = prompts_dir.join("fusion_instructions.txt");
    if successful >= MIN_SEGMENTS_FOR_FUSION && fusion_file.is_file() {
        let instructions = fs::read_to_string(&fusion_file)?;
        let texts: Vec<&str> =
            results.iter().map(|r| r.final_text.as_str()).filter(|t| !t.is_empty()).collect();
        if texts.len() >= MIN_SEGMENTS_FOR_FUSION {
            if let Some(fused) = generator.generate_fusion(&instructions, &texts).await {
                save_with_backup(&output_dir.join("fusion_result.txt"), &fused)?;
                info!("Fusion done: {} words", count_words(&fused));
                fusion_generated = true;
            }
        }
    }

    let log = GenerationLog {
        episode: episode.clone(),
        timestamp: chrono::Local::now().to_rfc3339(),
        total_words: results.iter().map(|r| r.final_wordcount).sum(),
        successful_segments: successful,
        total_segments: results.len(),
        fusion_generated,
        status: if successful == results.len() { "complete" } else { "partial" }.to_string(),
        total_generation_time: results.iter().map(|r| r.generation_time).sum(),
        cache_hits: results.iter().filter(|r| r.from_cache).count(),
        segments: results,
    };
    fs::write(output_dir.join("generation_log.json"), serde_json::to_string_pretty(&log)?)?;

    info!(
        "Episode {} done: {}/{} segments, {} cache hits, results in {}",
        episode,
        log.successful_segments,
        log.total_segments,
        log.cache_hits,
        output_dir.display()
    );
    Ok(log)
}
