//! Per-episode prompt files derived from an outline's `osnova.json`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::args::PromptsArgs;
use crate::error::PipelineError;
use crate::events::{Event, emit};
use crate::lang::Language;
use crate::paths::{PathResolver, Stage, resolve_topic_dir, slugify};

const SEGMENT_PROMPT: &str = include_str!("../templates/segment_prompt.txt");
const FIX_TEMPLATE: &str = include_str!("../templates/fix_template.txt");
const FUSION_PROMPT: &str = include_str!("../templates/fusion_prompt.txt");
const PARAMS_JSON: &str = include_str!("../templates/params.json");
const HANDOFF_JSON: &str = include_str!("../templates/handoff_phrases.json");

/// Search order when no language is given.
const LANGUAGE_PREFERENCE: [Language; 5] = [Language::Cs, Language::En, Language::De, Language::Fr, Language::Es];

static MMSS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+):(\d{2})$").unwrap());
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([A-Z0-9_]+)\}").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptParams {
    #[serde(default = "default_wpm")]
    pub wpm: u32,
    #[serde(default = "default_tolerance")]
    pub word_tolerance_percent: u32,
    #[serde(default = "default_numbers_style")]
    pub numbers_style: String,
}

fn default_wpm() -> u32 {
    145
}

fn default_tolerance() -> u32 {
    3
}

fn default_numbers_style() -> String {
    "digits_for_years".to_string()
}

impl Default for PromptParams {
    fn default() -> Self {
        Self {
            wpm: default_wpm(),
            word_tolerance_percent: default_tolerance(),
            numbers_style: default_numbers_style(),
        }
    }
}

/// Templates plus the raw meta files copied next to each episode context.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    pub segment: String,
    pub fix: String,
    pub fusion: String,
    pub params_raw: String,
    pub handoff_raw: String,
}

impl PromptTemplates {
    pub fn builtin() -> Self {
        Self {
            segment: SEGMENT_PROMPT.to_string(),
            fix: FIX_TEMPLATE.to_string(),
            fusion: FUSION_PROMPT.to_string(),
            params_raw: PARAMS_JSON.to_string(),
            handoff_raw: HANDOFF_JSON.to_string(),
        }
    }

    /// Reads every template from `dir`. A missing file is invalid input.
    pub fn load(dir: &Path) -> Result<Self> {
        let read = |name: &str| -> Result<String> {
            let path = dir.join(name);
            if !path.is_file() {
                return Err(PipelineError::Validation(format!("required file not found: {}", path.display())).into());
            }
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
        };
        Ok(Self {
            segment: read("segment_prompt.txt")?,
            fix: read("fix_template.txt")?,
            fusion: read("fusion_prompt.txt")?,
            params_raw: read("params.json")?,
            handoff_raw: read("handoff_phrases.json")?,
        })
    }

    pub fn params(&self) -> Result<PromptParams, PipelineError> {
        serde_json::from_str(&self.params_raw).map_err(|e| PipelineError::Validation(format!("params.json: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPlan {
    pub segment_index: u32,
    pub msp_label: String,
    pub minutes_target: u32,
    pub word_target: u32,
    #[serde(default)]
    pub sources_segment: Vec<String>,
}

/// Contents of `meta/episode_context.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodePlan {
    pub series_title: String,
    pub episodes_total: u32,
    pub episode_number: u32,
    pub episode_title: String,
    pub episode_description: String,
    #[serde(default)]
    pub viewer_takeaway: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub confidence_note: String,
    pub segments: Vec<SegmentPlan>,
    pub segments_total: u32,
    #[serde(default)]
    pub series_slug: String,
    #[serde(default)]
    pub episode_code: String,
}

/// Rounds an `mm:ss` duration to whole minutes, halves going up.
pub fn minutes_round_half_up(mmss: &str) -> Result<u32, PipelineError> {
    let invalid = || PipelineError::Validation(format!("invalid mm:ss duration: {mmss:?}"));
    let caps = MMSS.captures(mmss.trim()).ok_or_else(invalid)?;
    let minutes: u64 = caps[1].parse().map_err(|_| invalid())?;
    let seconds: u64 = caps[2].parse().map_err(|_| invalid())?;
    if seconds >= 60 {
        return Err(invalid());
    }
    let total = (minutes * 60 + seconds) as f64;
    Ok((total / 60.0 + 0.5).floor() as u32)
}

pub fn word_target(minutes: u32, wpm: u32) -> u32 {
    (minutes as f64 * wpm as f64 * 0.9 + 0.5).floor() as u32
}

/// Label of an MSP entry, which is either a plain string or an object.
pub fn extract_msp_label(msp: &Value) -> Result<String, PipelineError> {
    let label = match msp {
        Value::String(s) => s.trim().to_string(),
        Value::Object(map) => ["text", "label", "msp_label", "msp"]
            .iter()
            .filter_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .unwrap_or_default()
            .to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if label.is_empty() {
        let preview: String = msp.to_string().chars().take(100).collect();
        return Err(PipelineError::Validation(format!("missing MSP label in {preview}")));
    }
    Ok(label)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn str_field(episode: &Value, key: &str) -> String {
    episode.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

pub fn build_episode_context(
    series_title: &str,
    episodes_total: u32,
    episode: &Value,
    idx: u32,
    params: &PromptParams,
) -> Result<EpisodePlan, PipelineError> {
    let episode_title = episode
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Episode {idx}"));
    let episode_description = match episode.get("description") {
        Some(Value::Array(items)) => items
            .iter()
            .take(2)
            .filter_map(Value::as_str)
            .map(str::trim)
            .collect::<Vec<_>>()
            .join(" "),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    };

    let msp_list = episode.get("msp").and_then(Value::as_array).cloned().unwrap_or_default();
    let seg_times = string_list(episode.get("runtime").and_then(|r| r.get("segments")));
    if seg_times.len() != msp_list.len() {
        return Err(PipelineError::Validation(format!(
            "episode {idx}: runtime.segments count {} != MSP count {}",
            seg_times.len(),
            msp_list.len()
        )));
    }

    let sources_used = string_list(episode.get("sources_used"));
    let mut segments = Vec::with_capacity(msp_list.len());
    for (i, (msp, dur)) in msp_list.iter().zip(&seg_times).enumerate() {
        let segment_index = i as u32 + 1;
        let minutes_target = minutes_round_half_up(dur)?;
        let msp_label = extract_msp_label(msp)
            .map_err(|e| PipelineError::Validation(format!("episode {idx} segment {segment_index}: {e}")))?;
        let mut sources_segment = string_list(msp.get("sources_segment"));
        if sources_segment.is_empty() {
            warn!(
                "Episode {} segment {} ({}) has no sources_segment, using episode sources",
                idx, segment_index, msp_label
            );
            sources_segment = sources_used.clone();
        }
        segments.push(SegmentPlan {
            segment_index,
            msp_label,
            minutes_target,
            word_target: word_target(minutes_target, params.wpm),
            sources_segment,
        });
    }

    let mut sources: Vec<String> = Vec::new();
    for s in segments.iter().flat_map(|seg| seg.sources_segment.iter()) {
        if !sources.contains(s) {
            sources.push(s.clone());
        }
    }
    if sources.is_empty() {
        sources = sources_used;
    }

    Ok(EpisodePlan {
        series_title: series_title.to_string(),
        episodes_total,
        episode_number: idx,
        episode_title,
        episode_description,
        viewer_takeaway: str_field(episode, "viewer_takeaway"),
        sources,
        confidence_note: str_field(episode, "confidence_note"),
        segments_total: segments.len() as u32,
        segments,
        series_slug: String::new(),
        episode_code: format!("ep{idx:02}"),
    })
}

/// Replaces `{KEY}` placeholders. Unknown keys are left as they are.
pub fn replace_placeholders(template: &str, mapping: &HashMap<&str, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| match mapping.get(&caps[1]) {
            Some(v) => v.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn write_text(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

/// Writes the execution, fix and fusion prompts for one episode into `<ep_dir>/prompts`.
pub fn generate_for_episode(
    ep_dir: &Path,
    plan: &EpisodePlan,
    params: &PromptParams,
    templates: &PromptTemplates,
    lang: Language,
) -> std::io::Result<Vec<PathBuf>> {
    let prompts_dir = ep_dir.join("prompts");
    fs::create_dir_all(&prompts_dir)?;
    let lang = lang.lower();
    let tolerance = params.word_tolerance_percent.to_string();
    let mut written = Vec::new();

    for seg in &plan.segments {
        let mapping = HashMap::from([
            ("LANG", lang.clone()),
            ("NUMBERS_STYLE", params.numbers_style.clone()),
            ("SERIES_TITLE", plan.series_title.clone()),
            ("TOTAL_EPISODES", plan.episodes_total.to_string()),
            ("EPISODE_NUMBER", plan.episode_number.to_string()),
            ("EPISODE_TITLE", plan.episode_title.clone()),
            ("EPISODE_DESCRIPTION", plan.episode_description.clone()),
            ("SEGMENT_INDEX", seg.segment_index.to_string()),
            ("SEGMENTS_TOTAL", plan.segments_total.to_string()),
            ("MSP_LABEL", seg.msp_label.clone()),
            ("MINUTES_TARGET", seg.minutes_target.to_string()),
            ("WORD_TARGET", seg.word_target.to_string()),
            ("WORD_TOLERANCE_PERCENT", tolerance.clone()),
            ("SOURCES_SEGMENT", seg.sources_segment.join(", ")),
        ]);
        let fix_mapping = HashMap::from([
            ("WORD_TARGET", seg.word_target.to_string()),
            ("WORD_TOLERANCE_PERCENT", tolerance.clone()),
        ]);

        let exec_path = prompts_dir.join(format!("msp_{:02}_execution.txt", seg.segment_index));
        let fix_path = prompts_dir.join(format!("msp_{:02}_fix_template.txt", seg.segment_index));
        write_text(&exec_path, &replace_placeholders(&templates.segment, &mapping))?;
        write_text(&fix_path, &replace_placeholders(&templates.fix, &fix_mapping))?;
        written.push(exec_path);
        written.push(fix_path);
    }

    let fusion_mapping = HashMap::from([
        ("EPISODE_NUMBER", plan.episode_number.to_string()),
        ("SERIES_TITLE", plan.series_title.clone()),
        ("LANG", lang),
    ]);
    let fusion_path = prompts_dir.join("fusion_instructions.txt");
    write_text(&fusion_path, &replace_placeholders(&templates.fusion, &fusion_mapping))?;
    written.push(fusion_path);
    Ok(written)
}

fn write_meta(ep_dir: &Path, plan: &EpisodePlan, templates: &PromptTemplates) -> Result<()> {
    let meta_dir = ep_dir.join("meta");
    fs::create_dir_all(&meta_dir).with_context(|| format!("creating {}", meta_dir.display()))?;
    let json = serde_json::to_string_pretty(plan)?;
    fs::write(meta_dir.join("episode_context.json"), json)?;
    fs::write(meta_dir.join("params.json"), &templates.params_raw)?;
    fs::write(meta_dir.join("handoff_phrases.json"), &templates.handoff_raw)?;
    fs::write(meta_dir.join("fusion_prompt.txt"), &templates.fusion)?;
    Ok(())
}

pub fn series_title_of(osnova: &Value) -> String {
    ["series_title", "series_title_cs", "topic"]
        .iter()
        .filter_map(|k| osnova.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .unwrap_or("Series")
        .to_string()
}

/// Picks the requested language, or the first one with an `osnova.json`.
pub fn select_language(topic_dir: &Path, prefer: Option<Language>) -> Result<Language, PipelineError> {
    let has_outline = |lang: Language| topic_dir.join(lang.code()).join("osnova.json").is_file();
    match prefer {
        Some(lang) if has_outline(lang) => Ok(lang),
        Some(lang) => Err(PipelineError::Validation(format!(
            "no osnova.json for {} in {}",
            lang,
            topic_dir.display()
        ))),
        None => LANGUAGE_PREFERENCE.into_iter().find(|l| has_outline(*l)).ok_or_else(|| {
            PipelineError::Validation(format!("no language folders with osnova.json found in {}", topic_dir.display()))
        }),
    }
}

/// Generates prompts for every episode of one outline. Returns the episode directories.
pub fn generate_series(
    osnova: &Value,
    topic_name: &str,
    lang: Language,
    output_root: &Path,
    templates: &PromptTemplates,
) -> Result<Vec<PathBuf>> {
    let params = templates.params()?;
    let series_title = series_title_of(osnova);
    let episodes = osnova
        .get("episodes")
        .and_then(Value::as_array)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| PipelineError::Validation("osnova.json: 'episodes' must be a non-empty array".to_string()))?;
    let episodes_total = episodes.len() as u32;
    let series_slug = slugify(topic_name);

    let mut dirs = Vec::with_capacity(episodes.len());
    for (i, episode) in episodes.iter().enumerate() {
        let idx = i as u32 + 1;
        let mut plan = build_episode_context(&series_title, episodes_total, episode, idx, &params)
            .with_context(|| format!("failed to transform episode {idx}"))?;
        plan.series_slug = series_slug.clone();
        info!("Episode {}: {} ({} segments)", idx, plan.episode_title, plan.segments_total);

        let ep_dir = output_root.join(&plan.episode_code);
        write_meta(&ep_dir, &plan, templates)?;
        let written = generate_for_episode(&ep_dir, &plan, &params, templates, lang)
            .with_context(|| format!("prompt generation failed for episode {idx}"))?;
        debug!("wrote {} prompt files to {}", written.len(), ep_dir.display());
        dirs.push(ep_dir);
    }
    Ok(dirs)
}

pub fn run(args: &PromptsArgs) -> Result<()> {
    emit(Event::phase("start"));
    let outline_root = args.outline_root.clone().unwrap_or_else(|| PathResolver::root(Stage::Outline));
    let prompts_root = args.prompts_root.clone().unwrap_or_else(|| PathResolver::root(Stage::Prompts));

    let topic_dir = resolve_topic_dir(&outline_root, &args.topic);
    if !topic_dir.is_dir() {
        return Err(PipelineError::Validation(format!("topic not found: {}", topic_dir.display())).into());
    }
    let lang = select_language(&topic_dir, args.language)?;
    info!("Selected topic {} ({})", args.topic, lang);

    let templates = match &args.templates_dir {
        Some(dir) => PromptTemplates::load(dir)?,
        None => PromptTemplates::builtin(),
    };

    let osnova_path = topic_dir.join(lang.code()).join("osnova.json");
    let raw = fs::read_to_string(&osnova_path).with_context(|| format!("reading {}", osnova_path.display()))?;
    let osnova: Value = serde_json::from_str(&raw)
        .map_err(|e| PipelineError::Validation(format!("{}: {e}", osnova_path.display())))?;

    let topic_dir_name = topic_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.topic.clone());
    let output_root = prompts_root.join(&topic_dir_name).join(lang.code());
    if output_root.exists() {
        if !args.yes {
            return Err(PipelineError::Validation(format!(
                "output already exists: {} (pass --yes to overwrite)",
                output_root.display()
            ))
            .into());
        }
        fs::remove_dir_all(&output_root)
            .map_err(|e| PipelineError::Io(format!("failed to remove {}: {e}", output_root.display())))?;
    }

    emit(Event::phase("generating"));
    let dirs = generate_series(&osnova, &args.topic, lang, &output_root, &templates)?;
    for dir in &dirs {
        emit(Event::OutputPath { value: dir.display().to_string() });
    }
    info!("Prompts for {} episodes written to {}", dirs.len(), output_root.display());
    emit(Event::Done);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::model::tests::sample_json;
    use tempfile::TempDir;

    #[test]
    fn minutes_round_half_up_cases() {
        assert_eq!(minutes_round_half_up("20:00").unwrap(), 20);
        assert_eq!(minutes_round_half_up("20:30").unwrap(), 21);
        assert_eq!(minutes_round_half_up("20:29").unwrap(), 20);
        assert_eq!(minutes_round_half_up("0:30").unwrap(), 1);
        assert!(minutes_round_half_up("20:60").is_err());
        assert!(minutes_round_half_up("twenty").is_err());
    }

    #[test]
    fn word_target_rounds() {
        assert_eq!(word_target(20, 145), 2610);
        assert_eq!(word_target(1, 145), 131);
        assert_eq!(word_target(0, 145), 0);
    }

    #[test]
    fn msp_label_formats() {
        assert_eq!(extract_msp_label(&Value::from("  Legie ")).unwrap(), "Legie");
        assert_eq!(extract_msp_label(&serde_json::json!({"label": "A", "msp": "B"})).unwrap(), "A");
        assert_eq!(extract_msp_label(&serde_json::json!({"text": "", "msp_label": "C"})).unwrap(), "C");
        assert!(extract_msp_label(&serde_json::json!({"timestamp": "00:00"})).is_err());
        assert!(extract_msp_label(&Value::from("")).is_err());
    }

    #[test]
    fn episode_context_from_outline() {
        let osnova = sample_json();
        let ep = &osnova["episodes"][0];
        let plan = build_episode_context("Cesta k republice", 1, ep, 1, &PromptParams::default()).unwrap();
        assert_eq!(plan.episode_description, "Masaryk odchází do exilu. Začíná zahraniční odboj.");
        assert_eq!(plan.segments_total, 3);
        assert_eq!(plan.segments[2].minutes_target, 21);
        assert_eq!(plan.segments[2].word_target, word_target(21, 145));
        assert_eq!(plan.sources, vec!["Masaryk, Světová revoluce", "Klimek, Boj o Hrad, pp. 10–20"]);
        assert_eq!(plan.episode_code, "ep01");
    }

    #[test]
    fn missing_segment_sources_fall_back() {
        let ep = serde_json::json!({
            "title": "T",
            "msp": ["Jedna", {"text": "Dva", "sources_segment": []}],
            "runtime": {"segments": ["10:00", "10:00"]},
            "sources_used": ["Zdroj"]
        });
        let plan = build_episode_context("S", 2, &ep, 2, &PromptParams::default()).unwrap();
        assert_eq!(plan.segments[0].sources_segment, vec!["Zdroj"]);
        assert_eq!(plan.segments[1].msp_label, "Dva");
        assert_eq!(plan.sources, vec!["Zdroj"]);
    }

    #[test]
    fn segment_count_mismatch_is_invalid() {
        let ep = serde_json::json!({"msp": ["A"], "runtime": {"segments": ["10:00", "10:00"]}});
        let err = build_episode_context("S", 1, &ep, 1, &PromptParams::default()).unwrap_err();
        assert!(err.to_string().contains("runtime.segments count 2 != MSP count 1"));
    }

    #[test]
    fn placeholders_keep_unknown_keys() {
        let map = HashMap::from([("WORD_TARGET", "500".to_string())]);
        assert_eq!(
            replace_placeholders("{WORD_TARGET} words, {ISSUE_LIST} {lower}", &map),
            "500 words, {ISSUE_LIST} {lower}"
        );
    }

    #[test]
    fn series_title_fallbacks() {
        assert_eq!(series_title_of(&serde_json::json!({"series_title_cs": "Řada", "topic": "T"})), "Řada");
        assert_eq!(series_title_of(&serde_json::json!({"topic": "T"})), "T");
        assert_eq!(series_title_of(&serde_json::json!({})), "Series");
    }

    #[test]
    fn language_selection_prefers_existing_outline() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("EN")).unwrap();
        fs::write(tmp.path().join("EN/osnova.json"), "{}").unwrap();
        fs::create_dir_all(tmp.path().join("CS")).unwrap();
        assert_eq!(select_language(tmp.path(), None).unwrap(), Language::En);
        assert!(select_language(tmp.path(), Some(Language::De)).is_err());
    }

    #[test]
    fn series_writes_prompts_and_meta() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("Vznik Československa").join("CS");
        let dirs = generate_series(&sample_json(), "Vznik Československa", Language::Cs, &out, &PromptTemplates::builtin())
            .unwrap();
        assert_eq!(dirs, vec![out.join("ep01")]);

        let ep = out.join("ep01");
        let exec = fs::read_to_string(ep.join("prompts/msp_02_execution.txt")).unwrap();
        assert!(exec.contains("MAIN STORY POINT: Legie v Rusku"));
        assert!(exec.contains("LANGUAGE: cs"));
        assert!(exec.contains("SOURCES: Klimek, Boj o Hrad, pp. 10–20"));
        let fix = fs::read_to_string(ep.join("prompts/msp_01_fix_template.txt")).unwrap();
        assert!(fix.contains("{ISSUE_LIST}"));
        assert!(fix.contains("2610 words"));
        assert!(ep.join("prompts/fusion_instructions.txt").is_file());
        assert!(ep.join("meta/params.json").is_file());
        assert!(ep.join("meta/handoff_phrases.json").is_file());

        let ctx: EpisodePlan =
            serde_json::from_str(&fs::read_to_string(ep.join("meta/episode_context.json")).unwrap()).unwrap();
        assert_eq!(ctx.series_slug, "vznik_ceskoslovenska");
        assert_eq!(ctx.series_title, "Cesta k republice");
    }
}
