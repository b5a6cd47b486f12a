use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::OutlineError;
use super::citations::canonicalize_parsed_citations;
use super::config::OutlineConfig;
use super::model::OutlineJson;
use crate::cache::{JsonCache, key_for_text};
use crate::lang::Language;
use crate::llm::{ChatModel, ChatRequest, UsageMonitor};
use crate::paths::sanitize_filename;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").unwrap());
static FENCE_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^```(?:json)?\s*").unwrap());
static FENCE_CLOSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*```$").unwrap());

const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
const SYSTEM_PROMPT: &str =
    "You are a helpful assistant that generates structured JSON for documentary series outlines.";

const RULES: &str = "You are a strict JSON generator. Return ONLY a single valid UTF-8 JSON object, \
with no Markdown, no comments, no trailing prose.

CRITICAL REQUIREMENTS:
- Return pure JSON that a standard JSON parser accepts
- Use proper UTF-8 encoding for all text
- Ensure all required fields are present
- Follow the exact schema specified

CITATION RULES:
- Use EXACT strings from the episode's 'sources_used' array when filling each MSP 'sources_segment'.
- If a 'sources_used' item includes a page interval, choose a subrange strictly inside it and format as: \", pp. A–B\".
- If a 'sources_used' item has NO pages, DO NOT invent pages; use the exact source string only.
- Preserve diacritics and punctuation exactly as shown in 'sources_used'.
- Do NOT create, translate, or modify source strings.
";

/// Replaces `{{ key }}` placeholders; unknown keys are left as they are.
pub fn render_template(template: &str, values: &BTreeMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            values.get(&caps[1]).cloned().unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Pulls a JSON object out of a model reply: the whole reply, then the
/// outermost braces, then the reply with code fences removed.
pub fn parse_json_response(raw: &str) -> Result<serde_json::Value, OutlineError> {
    if let Ok(v) = serde_json::from_str(raw) {
        return Ok(v);
    }
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if end > start {
            if let Ok(v) = serde_json::from_str(&raw[start..=end]) {
                return Ok(v);
            }
        }
    }
    let cleaned = FENCE_OPEN.replace(raw, "");
    let cleaned = FENCE_CLOSE.replace(&cleaned, "");
    serde_json::from_str(&cleaned).map_err(|_| OutlineError::UnparsableResponse)
}

/// Builds the per-language generation prompt from a rendered template.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    config: Arc<OutlineConfig>,
    rendered: String,
}

impl PromptBuilder {
    pub fn new(config: Arc<OutlineConfig>, template: &str) -> Self {
        let rendered = render_template(template, &config.flatten());
        Self { config, rendered }
    }

    pub fn prompt_for(&self, lang: Language) -> String {
        let code = lang.code();
        let c = &self.config;
        let filled = self.rendered.replace("{LANG}", code);
        let schema = format!(
            r#"
OUTPUT JSON SCHEMA:
{{
  "language": "{code}",
  "topic": "{topic}",
  "series_title": "string",
  "series_context": ["sentence1", "sentence2", ...],
  "episodes": [
    {{
      "index": 1,
      "title": "string",
      "description": ["sentence1", ...],  // max {desc}
      "msp": [
        {{
          "timestamp": "mm:ss",
          "text": "string with max {words} words",
          "sources_segment": ["source_name1", ...]
        }}
      ],  // exactly {msp} items
      "runtime": {{
        "segments": ["mm:ss", ...],
        "sum_minutes": integer  // {tmin}-{tmax}
      }},
      "viewer_takeaway": "string",
      "sources_used": ["source_name1", ...],  // {smin}-{smax}
      "confidence_note": "string"
    }}
  ]
}}

REQUIREMENTS:
- Language MUST be "{code}"
- Topic MUST be "{topic}"
- Each episode MUST have exactly {msp} MSP items
- Runtime sum MUST be between {tmin} and {tmax} minutes
- Each MSP sources_segment must reference sources from sources_used
"#,
            topic = c.topic,
            desc = c.description_max_sentences,
            words = c.msp_max_words,
            msp = c.msp_per_episode,
            tmin = c.tolerance_min,
            tmax = c.tolerance_max,
            smin = c.sources.per_episode.min,
            smax = c.sources.per_episode.max,
        );
        format!("{RULES}\n\n{filled}\n\n{schema}\n\nGENERATE JSON NOW:")
    }
}

/// A saved outline for one language.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlineOutcome {
    pub language: Language,
    pub outline: OutlineJson,
    pub output_path: PathBuf,
}

pub fn language_dir(output_dir: &Path, topic: &str, lang: Language) -> PathBuf {
    output_dir.join(sanitize_filename(topic)).join(lang.code())
}

#[derive(Clone)]
pub struct OutlineGenerator {
    prompts: PromptBuilder,
    config: Arc<OutlineConfig>,
    output_dir: PathBuf,
    model: Arc<dyn ChatModel>,
    cache: Option<JsonCache>,
    monitor: Arc<UsageMonitor>,
}

impl OutlineGenerator {
    pub fn new(
        config: Arc<OutlineConfig>,
        template: &str,
        output_dir: PathBuf,
        model: Arc<dyn ChatModel>,
        use_cache: bool,
        monitor: Arc<UsageMonitor>,
    ) -> Self {
        let cache = use_cache.then(|| JsonCache::new(output_dir.join(".cache"), Some(CACHE_TTL)));
        Self { prompts: PromptBuilder::new(config.clone(), template), config, output_dir, model, cache, monitor }
    }

    fn cache_key(&self, lang: Language) -> String {
        key_for_text(&[&format!("{}_{}_{}", self.config.topic, lang.code(), self.config.model)])
    }

    pub async fn generate_for_language(&self, lang: Language) -> Result<OutlineOutcome, OutlineError> {
        info!("Generating outline for {}", lang);
        let key = self.cache_key(lang);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.load::<OutlineOutcome>(&key) {
                info!("Using cached outline for {}", lang);
                self.monitor.record_cache_hit();
                return Ok(hit);
            }
            self.monitor.record_cache_miss();
        }

        let req = ChatRequest::new(&self.config.model)
            .system(SYSTEM_PROMPT)
            .user(self.prompts.prompt_for(lang))
            .temperature(self.config.temperature)
            .max_tokens(self.config.max_tokens);
        let started = Instant::now();
        let resp = match self.model.chat(&req).await {
            Ok(r) => {
                self.monitor.record_call(&self.config.model, r.total_tokens(), r.latency, true);
                r
            }
            Err(e) => {
                self.monitor.record_call(&self.config.model, 0, started.elapsed(), false);
                return Err(e.into());
            }
        };

        let mut parsed = parse_json_response(&resp.text)?;
        canonicalize_parsed_citations(&mut parsed);
        let mut outline: OutlineJson =
            serde_json::from_value(parsed).map_err(|e| OutlineError::InvalidOutline(e.to_string()))?;

        if outline.language != lang {
            warn!("Language mismatch: expected {}, got {}", lang, outline.language);
            outline.language = lang;
        }
        if outline.topic != self.config.topic {
            warn!("Topic mismatch: expected {:?}, got {:?}", self.config.topic, outline.topic);
            outline.topic = self.config.topic.clone();
        }
        outline.validate()?;

        info!(
            "Outline for {}: {} episodes, {} min total, {} MSP items, {} distinct sources",
            lang,
            outline.episodes.len(),
            outline.total_runtime(),
            outline.total_msp_count(),
            outline.unique_sources().len()
        );
        let output_path = self.save_outline(&outline, lang)?;
        let outcome = OutlineOutcome { language: lang, outline, output_path };
        if let Some(cache) = &self.cache {
            cache.store(&key, &outcome);
        }
        info!("Successfully generated outline for {}", lang);
        Ok(outcome)
    }

    fn save_outline(&self, outline: &OutlineJson, lang: Language) -> Result<PathBuf, OutlineError> {
        let dir = language_dir(&self.output_dir, &self.config.topic, lang);
        fs::create_dir_all(&dir)?;
        let json_path = dir.join("osnova.json");
        fs::write(&json_path, serde_json::to_string_pretty(outline)?)?;
        debug!("Saved JSON to {}", json_path.display());
        let txt_path = dir.join("osnova.txt");
        fs::write(&txt_path, outline.to_text())?;
        debug!("Saved TXT to {}", txt_path.display());
        Ok(dir)
    }

    /// Results come back in configured language order.
    pub async fn generate_all(&self, parallel: bool) -> Vec<(Language, Result<OutlineOutcome, OutlineError>)> {
        let langs = self.config.languages.clone();
        if !parallel {
            let mut results = Vec::with_capacity(langs.len());
            for lang in langs {
                let r = self.generate_for_language(lang).await;
                if let Err(e) = &r {
                    error!("Failed to generate outline for {}: {}", lang, e);
                }
                results.push((lang, r));
            }
            return results;
        }

        let mut set = JoinSet::new();
        for (i, lang) in langs.iter().copied().enumerate() {
            let this = self.clone();
            set.spawn(async move { (i, lang, this.generate_for_language(lang).await) });
        }
        let mut indexed = Vec::with_capacity(langs.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, lang, r)) => {
                    if let Err(e) = &r {
                        error!("Failed to generate outline for {}: {}", lang, e);
                    }
                    indexed.push((i, lang, r));
                }
                Err(e) => error!("outline task panicked: {}", e),
            }
        }
        indexed.sort_by_key(|(i, _, _)| *i);
        indexed.into_iter().map(|(_, lang, r)| (lang, r)).collect()
    }
}

/// Writes each language's prompt without calling the model.
pub fn write_prompts(prompts: &PromptBuilder, config: &OutlineConfig, output_dir: &Path) -> Result<Vec<PathBuf>, OutlineError> {
    let mut written = Vec::new();
    for &lang in &config.languages {
        let dir = language_dir(output_dir, &config.topic, lang);
        fs::create_dir_all(&dir)?;
        let path = dir.join("outline_prompt.txt");
        fs::write(&path, prompts.prompt_for(lang))?;
        info!("[dry-run] prompt for {} written to {}", lang, path.display());
        written.push(path);
    }
    Ok(written)
}
