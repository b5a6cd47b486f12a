//! Episode-level post-processing: one merged narration per episode, with
//! optional generated intro and transitions.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::collect_txt_files;
use crate::error::PipelineError;
use crate::lang::Language;
use crate::llm::ChatModel;
use crate::manifest::{MANIFEST_FILE, Manifest, ManifestEntry, ManifestSource, utc_timestamp};
use crate::narration_core::generator::transition_fallback;
use crate::narration_core::{
    EpisodeContext, FormatterConfig, GeneratorConfig, IntroGenerator, NarrationCache, TextFormatter,
    TransitionGenerator, TransitionQualityValidator,
};
use crate::paths::{EpisodeLocation, ascii_fold, derive_episode_location};

pub const MERGED_FILE: &str = "episode_merged.txt";
const MERGED_META_FILE: &str = "episode_merged.txt.meta.json";
const TRANSITION_ATTEMPTS: usize = 3;

static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(1\d{3}|20\d{2})\b").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeOptions {
    pub use_gpt: bool,
    pub prefer_existing: bool,
    pub force_rebuild: bool,
    pub save_merged: bool,
}

impl Default for EpisodeOptions {
    fn default() -> Self {
        Self { use_gpt: false, prefer_existing: true, force_rebuild: false, save_merged: true }
    }
}

impl EpisodeOptions {
    fn may_reuse(&self) -> bool {
        self.prefer_existing && !self.force_rebuild
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpisodeOutcome {
    /// An earlier merged text was kept or copied in.
    Reused(PathBuf),
    /// Segments were merged; `None` when saving was disabled.
    Merged(Option<PathBuf>),
}

/// The LLM side of episode mode.
pub struct EpisodeWriters {
    pub model: Arc<dyn ChatModel>,
    pub generator: GeneratorConfig,
    pub cache: NarrationCache,
}

#[derive(Serialize)]
struct ReuseMeta<'a> {
    event: &'static str,
    source_path: String,
    output_path: String,
    topic: &'a str,
    lang: &'a str,
    episode: &'a str,
    timestamp: String,
}

#[derive(Serialize)]
struct MergedMeta<'a> {
    event: &'static str,
    topic: &'a str,
    lang: &'a str,
    episode: &'a str,
    length: usize,
    timestamp: String,
    provenance: &'static str,
}

fn reuse_slug(topic: &str) -> String {
    ascii_fold(topic).to_lowercase().replace(' ', "_")
}

/// A merged narration produced by the narration builder:
/// `<narration_root>/<slug>_<lang>_episode_<NNN>*.txt`.
pub fn find_reusable_merged(narration_root: &Path, loc: &EpisodeLocation) -> Option<PathBuf> {
    if loc.index == 0 {
        return None;
    }
    let prefix = format!("{}_{}_episode_{:03}", reuse_slug(&loc.topic), loc.lang, loc.index);
    let mut found: Vec<PathBuf> = fs::read_dir(narration_root)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name().map(|n| n.to_string_lossy()).is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".txt"))
        })
        .collect();
    found.sort();
    found.into_iter().next()
}

/// Year-anchored bridge sentence used when no generated transition passes validation.
pub fn anchored_transition(prev: &str, next: &str, lang: Language) -> String {
    let year = YEAR.find(next).or_else(|| YEAR.find(prev)).map(|m| m.as_str());
    match (lang, year) {
        (Language::Cs, Some(y)) => format!("Následně, v roce {y}, plynule navazujeme dalším vývojem."),
        (Language::Cs, None) => "Na tomto pozadí plynule navazujeme další částí vyprávění.".to_string(),
        (Language::En, Some(y)) => format!("Subsequently, in {y}, the narrative moves forward naturally."),
        (Language::En, None) => {
            "Against this backdrop, we move seamlessly to the next part of the narrative.".to_string()
        }
        (other, _) => transition_fallback(other).to_string(),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(value)?).with_context(|| format!("writing {}", path.display()))
}

fn read_lossy(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn compose_with_model(segments: &[String], loc: &EpisodeLocation, lang: Language, w: &EpisodeWriters) -> String {
    let intro_gen = IntroGenerator::new(w.model.clone(), w.generator.clone(), w.cache.clone());
    let trans_gen = TransitionGenerator::new(w.model.clone(), w.generator.clone(), w.cache.clone());
    let validator = TransitionQualityValidator::new(lang);
    let ctx = EpisodeContext {
        series_title: loc.topic.clone(),
        series_context: Vec::new(),
        episode_title: loc.episode.clone(),
        episode_description: Vec::new(),
        episode_index: loc.index.max(1),
        total_episodes: 0,
        language: lang,
    };
    let intro = intro_gen.generate(&ctx).await.text;

    let mut combined: Vec<String> = Vec::with_capacity(segments.len() * 2);
    for (i, pair) in segments.windows(2).enumerate() {
        let (prev, next) = (&pair[0], &pair[1]);
        combined.push(prev.clone());
        let mut transition = None;
        let mut reasons = Vec::new();
        for attempt in 1..=TRANSITION_ATTEMPTS {
            let candidate = trans_gen.generate(prev, next, lang).await.text;
            let verdict = validator.validate(prev, next, &candidate);
            if verdict.ok {
                transition = Some(candidate);
                break;
            }
            info!("transition {} rejected (attempt {}): {}", i + 1, attempt, verdict.reasons.join(", "));
            reasons = verdict.reasons;
        }
        let transition = transition.unwrap_or_else(|| {
            warn!("transition {} falls back to an anchored phrase: {}", i + 1, reasons.join(", "));
            anchored_transition(prev, next, lang)
        });
        combined.push(transition);
    }
    if let Some(last) = segments.last() {
        combined.push(last.clone());
    }

    let merged = format!("{}\n\n{}", intro.trim(), combined.join(" ").trim());
    let mut formatter = TextFormatter::new(FormatterConfig { model: w.generator.model.clone(), ..FormatterConfig::new(lang) });
    formatter.format_with_editor(&merged, w.model.as_ref()).await
}

fn write_manifest(out_dir: &Path, loc: &EpisodeLocation) -> Result<PathBuf> {
    let mut files = Vec::new();
    let mut paths: Vec<PathBuf> = WalkDir::new(out_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    paths.sort();
    for p in paths {
        let name = p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let ext = p.extension().map(|e| e.to_string_lossy().to_lowercase()).unwrap_or_default();
        if name == MANIFEST_FILE || !(ext == "txt" || ext == "json") {
            continue;
        }
        let rel = p.strip_prefix(out_dir).unwrap_or(&p).to_string_lossy().into_owned();
        files.push(ManifestEntry::from_file(&p, &rel)?);
    }
    let source = ManifestSource { topic: loc.topic.clone(), lang: loc.lang.clone(), episode: loc.episode.clone() };
    let path = out_dir.join(MANIFEST_FILE);
    Manifest::new(source, files).write(&path)?;
    Ok(path)
}

/// Merges the segments of the episode at `in_dir` into `<out_base>/<topic>/<lang>/<ep>/episode_merged.txt`.
pub async fn process_episode_dir(
    in_dir: &Path,
    out_base: &Path,
    narration_root: &Path,
    opts: EpisodeOptions,
    writers: Option<&EpisodeWriters>,
) -> Result<EpisodeOutcome> {
    let loc = derive_episode_location(in_dir);
    let out_dir = out_base.join(&loc.topic).join(&loc.lang).join(&loc.episode);
    fs::create_dir_all(&out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let merged_path = out_dir.join(MERGED_FILE);

    if opts.may_reuse() && merged_path.exists() {
        info!("{} already present, keeping it", merged_path.display());
        return Ok(EpisodeOutcome::Reused(merged_path));
    }
    if opts.may_reuse() {
        if let Some(candidate) = find_reusable_merged(narration_root, &loc) {
            fs::write(&merged_path, read_lossy(&candidate)?)
                .with_context(|| format!("writing {}", merged_path.display()))?;
            let meta = ReuseMeta {
                event: "reused_merged",
                source_path: fs::canonicalize(&candidate).unwrap_or(candidate).display().to_string(),
                output_path: fs::canonicalize(&merged_path).unwrap_or_else(|_| merged_path.clone()).display().to_string(),
                topic: &loc.topic,
                lang: &loc.lang,
                episode: &loc.episode,
                timestamp: utc_timestamp(),
            };
            write_json(&out_dir.join(MERGED_META_FILE), &meta)?;
            info!("reused merged narration {}", meta.source_path);
            return Ok(EpisodeOutcome::Reused(merged_path));
        }
    }

    let files = collect_txt_files(in_dir);
    if files.is_empty() {
        return Err(PipelineError::Validation(format!("no segments found in {}", in_dir.display())).into());
    }
    let mut segments = Vec::with_capacity(files.len());
    for f in &files {
        segments.push(read_lossy(f)?.trim().to_string());
    }

    let merged = match (opts.use_gpt, writers) {
        (true, Some(w)) => {
            let lang: Language = loc
                .lang
                .parse()
                .map_err(|e: String| PipelineError::Validation(format!("{}: {e}", in_dir.display())))?;
            compose_with_model(&segments, &loc, lang, w).await
        }
        (true, None) => {
            return Err(PipelineError::Validation("episode mode with a model requested but none configured".into()).into());
        }
        (false, _) => segments.join(" "),
    };

    if !opts.save_merged {
        return Ok(EpisodeOutcome::Merged(None));
    }
    fs::write(&merged_path, &merged).with_context(|| format!("writing {}", merged_path.display()))?;
    let meta = MergedMeta {
        event: "episode_merged",
        topic: &loc.topic,
        lang: &loc.lang,
        episode: &loc.episode,
        length: merged.chars().count(),
        timestamp: utc_timestamp(),
        provenance: if opts.use_gpt { "gpt" } else { "offline_or_reuse_failed" },
    };
    write_json(&out_dir.join(MERGED_META_FILE), &meta)?;
    info!("merged {} segments into {}", segments.len(), merged_path.display());

    match write_manifest(&out_dir, &loc) {
        Ok(p) => info!("manifest written: {}", p.display()),
        Err(e) => warn!("could not write manifest for {}: {:#}", out_dir.display(), e),
    }
    Ok(EpisodeOutcome::Merged(Some(merged_path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedModel;
    use tempfile::TempDir;

    fn episode_fixture(root: &Path) -> PathBuf {
        let narration = root.join("narration_in").join("Velká válka").join("CS").join("ep01").join("narration");
        fs::create_dir_all(&narration).unwrap();
        fs::write(narration.join("segment_01.txt"), "  Válka začala v roce 1914. \n").unwrap();
        fs::write(narration.join("segment_02.txt"), "Rok 1918 přinesl konec.").unwrap();
        narration.parent().unwrap().to_path_buf()
    }

    #[test]
    fn anchored_transition_prefers_next_year() {
        let t = anchored_transition("V roce 1914.", "Roku 1918 skončila.", Language::Cs);
        assert_eq!(t, "Následně, v roce 1918, plynule navazujeme dalším vývojem.");
        let t = anchored_transition("No year here.", "Nor here.", Language::En);
        assert!(t.starts_with("Against this backdrop"));
        assert_eq!(anchored_transition("1914", "", Language::De), transition_fallback(Language::De));
    }

    #[tokio::test]
    async fn offline_merge_writes_text_meta_and_manifest() {
        let tmp = TempDir::new().unwrap();
        let ep = episode_fixture(tmp.path());
        let out = tmp.path().join("out");
        let outcome =
            process_episode_dir(&ep, &out, &tmp.path().join("none"), EpisodeOptions::default(), None).await.unwrap();
        let merged_path = out.join("Velká válka").join("CS").join("ep01").join(MERGED_FILE);
        assert_eq!(outcome, EpisodeOutcome::Merged(Some(merged_path.clone())));
        assert_eq!(fs::read_to_string(&merged_path).unwrap(), "Válka začala v roce 1914. Rok 1918 přinesl konec.");

        let dir = merged_path.parent().unwrap();
        let meta: serde_json::Value = serde_json::from_str(&fs::read_to_string(dir.join(MERGED_META_FILE)).unwrap()).unwrap();
        assert_eq!(meta["provenance"], "offline_or_reuse_failed");
        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join(MANIFEST_FILE)).unwrap()).unwrap();
        let listed: Vec<&str> = manifest["files"].as_array().unwrap().iter().map(|f| f["path"].as_str().unwrap()).collect();
        assert_eq!(listed, vec![MERGED_FILE, MERGED_META_FILE]);

        // Second run keeps the existing merge.
        let again =
            process_episode_dir(&ep, &out, &tmp.path().join("none"), EpisodeOptions::default(), None).await.unwrap();
        assert_eq!(again, EpisodeOutcome::Reused(merged_path));
    }

    #[tokio::test]
    async fn builder_output_is_reused_unless_forced() {
        let tmp = TempDir::new().unwrap();
        let ep = episode_fixture(tmp.path());
        let narration_root = tmp.path().join("narration");
        fs::create_dir_all(&narration_root).unwrap();
        fs::write(narration_root.join("velka_valka_CS_episode_001_final.txt"), "Hotový text.").unwrap();
        let out = tmp.path().join("out");

        let outcome = process_episode_dir(&ep, &out, &narration_root, EpisodeOptions::default(), None).await.unwrap();
        let merged_path = out.join("Velká válka").join("CS").join("ep01").join(MERGED_FILE);
        assert_eq!(outcome, EpisodeOutcome::Reused(merged_path.clone()));
        assert_eq!(fs::read_to_string(&merged_path).unwrap(), "Hotový text.");

        let forced = EpisodeOptions { force_rebuild: true, ..EpisodeOptions::default() };
        process_episode_dir(&ep, &out, &narration_root, forced, None).await.unwrap();
        assert!(fs::read_to_string(&merged_path).unwrap().contains("1914"));
    }

    #[tokio::test]
    async fn empty_episode_is_a_validation_error() {
        let tmp = TempDir::new().unwrap();
        let ep = tmp.path().join("t").join("CS").join("ep02");
        fs::create_dir_all(ep.join("narration")).unwrap();
        let err = process_episode_dir(&ep, &tmp.path().join("out"), tmp.path(), EpisodeOptions::default(), None)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<PipelineError>().is_some());
    }

    #[tokio::test]
    async fn failing_model_still_produces_a_merge() {
        let tmp = TempDir::new().unwrap();
        let ep = episode_fixture(tmp.path());
        let out = tmp.path().join("out");
        let writers = EpisodeWriters {
            model: Arc::new(ScriptedModel::failing()),
            generator: GeneratorConfig::default(),
            cache: NarrationCache::at(tmp.path().join("cache")),
        };
        let opts = EpisodeOptions { use_gpt: true, ..EpisodeOptions::default() };
        let outcome = process_episode_dir(&ep, &out, tmp.path(), opts, Some(&writers)).await.unwrap();
        let EpisodeOutcome::Merged(Some(path)) = outcome else { panic!("expected a merge") };
        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("válka"));
        assert!(!text.trim().is_empty());
    }
}
