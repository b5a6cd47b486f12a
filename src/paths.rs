use std::fs;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::error::PipelineError;

pub const NC_OUTPUTS_ROOT: &str = "NC_OUTPUTS_ROOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Outline,
    Prompts,
    Narration,
    Postprocess,
    Tts,
    Export,
}

impl Stage {
    pub fn env_var(self) -> &'static str {
        match self {
            Stage::Outline => "OUTLINE_OUTPUT_ROOT",
            Stage::Prompts => "PROMPTS_OUTPUT_ROOT",
            Stage::Narration => "NARRATION_OUTPUT_ROOT",
            Stage::Postprocess => "POSTPROC_OUTPUT_ROOT",
            Stage::Tts => "TTS_OUTPUT_ROOT",
            Stage::Export => "EXPORT_OUTPUT_ROOT",
        }
    }

    pub fn subdir(self) -> &'static str {
        match self {
            Stage::Outline => "outline",
            Stage::Prompts => "prompts",
            Stage::Narration => "narration",
            Stage::Postprocess => "postprocess",
            Stage::Tts => "tts",
            Stage::Export => "export",
        }
    }
}

/// Resolves stage output roots: stage env var, then `NC_OUTPUTS_ROOT/<stage>`,
/// then `./outputs/<stage>`.
pub struct PathResolver;

impl PathResolver {
    pub fn root(stage: Stage) -> PathBuf {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::root_with(stage, |k| std::env::var(k).ok(), &cwd)
    }

    pub fn root_with<F>(stage: Stage, lookup: F, cwd: &Path) -> PathBuf
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(stage.env_var()).filter(|v| !v.is_empty()) {
            debug!("{} root from {}: {}", stage.subdir(), stage.env_var(), v);
            return absolute(Path::new(&v), cwd);
        }
        if let Some(nc) = lookup(NC_OUTPUTS_ROOT).filter(|v| !v.is_empty()) {
            return absolute(Path::new(&nc), cwd).join(stage.subdir());
        }
        cwd.join("outputs").join(stage.subdir())
    }

    /// Base of the shared output tree, used by caches that live beside stage roots.
    pub fn outputs_base() -> PathBuf {
        match std::env::var(NC_OUTPUTS_ROOT) {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join("outputs"),
        }
    }
}

fn absolute(p: &Path, cwd: &Path) -> PathBuf {
    if p.is_absolute() { p.to_path_buf() } else { cwd.join(p) }
}

/// Resolves `.` and `..` without touching the filesystem.
pub fn normalize_lexically(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn resolve_for_compare(p: &Path, cwd: &Path) -> PathBuf {
    let abs = absolute(p, cwd);
    fs::canonicalize(&abs).unwrap_or_else(|_| normalize_lexically(&abs))
}

pub fn default_allowed_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(nc) = std::env::var(NC_OUTPUTS_ROOT) {
        if !nc.is_empty() {
            roots.push(PathBuf::from(nc));
        }
    }
    roots
}

/// Rejects paths that escape every allowed root.
pub fn sanitize_path(path: &Path, allowed_roots: &[PathBuf]) -> Result<PathBuf, PipelineError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let resolved = resolve_for_compare(path, &cwd);
    for root in allowed_roots {
        let root = resolve_for_compare(root, &cwd);
        if resolved.starts_with(&root) {
            return Ok(resolved);
        }
    }
    Err(PipelineError::Validation(format!(
        "path {} is outside allowed roots {:?}",
        path.display(),
        allowed_roots
    )))
}

static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());
static FORBIDDEN_FILENAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"[\\/:*?"<>|]+"#).unwrap());

/// Strips diacritics via NFKD decomposition.
pub fn ascii_fold(s: &str) -> String {
    s.nfkd().filter(|c| !is_combining_mark(*c)).collect()
}

fn underscore_slug(s: &str) -> String {
    let lower = s.to_lowercase();
    NON_ALNUM.replace_all(&lower, "_").trim_matches('_').to_string()
}

/// ASCII slug used for series ids and cache file names.
pub fn slugify(s: &str) -> String {
    let ascii: String = s.nfkd().filter(|c| c.is_ascii()).collect();
    let slug = underscore_slug(&ascii);
    if slug.is_empty() { "topic".to_string() } else { slug }
}

/// Case and diacritics insensitive key for matching directory names.
pub fn normalize_name(s: &str) -> String {
    underscore_slug(&ascii_fold(s))
}

pub fn sanitize_filename(name: &str) -> String {
    let replaced = FORBIDDEN_FILENAME.replace_all(name, "_");
    let trimmed = replaced.trim_matches(|c| c == '.' || c == ' ');
    let limited: String = trimmed.chars().take(100).collect();
    if limited.is_empty() { "unnamed".to_string() } else { limited }
}

pub fn resolve_topic_dir(root: &Path, topic: &str) -> PathBuf {
    let exact = root.join(topic);
    if exact.is_dir() {
        return exact;
    }
    let target = normalize_name(topic);
    match fs::read_dir(root) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() && normalize_name(&entry.file_name().to_string_lossy()) == target {
                    debug!("resolved topic {:?} to {}", topic, path.display());
                    return path;
                }
            }
        }
        Err(e) => {
            if root.exists() {
                warn!("failed to scan {}: {}", root.display(), e);
            }
        }
    }
    exact
}

/// Topic, language, episode name and episode number from an episode path
/// laid out as `.../<topic>/<lang>/<ep>[/narration]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeLocation {
    pub topic: String,
    pub lang: String,
    pub episode: String,
    pub index: u32,
}

fn name_of(p: &Path) -> String {
    p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

pub fn derive_episode_location(p: &Path) -> EpisodeLocation {
    let ep_dir = if name_of(p) == "narration" { p.parent().unwrap_or(p) } else { p };
    let lang_dir = ep_dir.parent().unwrap_or(ep_dir);
    let topic_dir = lang_dir.parent().unwrap_or(lang_dir);
    let episode = name_of(ep_dir);
    EpisodeLocation {
        topic: name_of(topic_dir),
        lang: name_of(lang_dir),
        index: episode_number(&episode),
        episode,
    }
}

pub fn episode_number(ep: &str) -> u32 {
    for part in ep.replace('_', " ").split_whitespace() {
        if part.chars().all(|c| c.is_ascii_digit()) {
            return part.parse().unwrap_or(0);
        }
        if part.to_lowercase().starts_with("ep") {
            let digits: String = part.chars().filter(|c| c.is_ascii_digit()).collect();
            if !digits.is_empty() {
                return digits.parse().unwrap_or(0);
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn stage_env_var_wins_over_shared_root() {
        let env: HashMap<&str, &str> =
            [("PROMPTS_OUTPUT_ROOT", "/data/p"), ("NC_OUTPUTS_ROOT", "/data/all")].into_iter().collect();
        let root = PathResolver::root_with(Stage::Prompts, |k| env.get(k).map(|s| s.to_string()), Path::new("/w"));
        assert_eq!(root, PathBuf::from("/data/p"));

        let root = PathResolver::root_with(Stage::Tts, |k| env.get(k).map(|s| s.to_string()), Path::new("/w"));
        assert_eq!(root, PathBuf::from("/data/all/tts"));

        let root = PathResolver::root_with(Stage::Export, |_| None, Path::new("/w"));
        assert_eq!(root, PathBuf::from("/w/outputs/export"));
    }

    #[test]
    fn slugify_strips_diacritics() {
        assert_eq!(slugify("Vznik Československa 1918"), "vznik_ceskoslovenska_1918");
        assert_eq!(slugify("   "), "topic");
        assert_eq!(normalize_name("Úžasná  Řeka!"), "uzasna_reka");
    }

    #[test]
    fn sanitize_filename_rules() {
        assert_eq!(sanitize_filename("a/b:c?"), "a_b_c_");
        assert_eq!(sanitize_filename(" .hidden. "), "hidden");
        assert_eq!(sanitize_filename("..."), "unnamed");
        assert_eq!(sanitize_filename(&"x".repeat(150)).len(), 100);
    }

    #[test]
    fn topic_dir_matches_without_diacritics() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("Vznik Československa")).unwrap();
        let found = resolve_topic_dir(tmp.path(), "vznik ceskoslovenska");
        assert_eq!(found, tmp.path().join("Vznik Československa"));
        let missing = resolve_topic_dir(tmp.path(), "Jiné");
        assert_eq!(missing, tmp.path().join("Jiné"));
    }

    #[test]
    fn sanitize_path_rejects_escape() {
        let tmp = TempDir::new().unwrap();
        let roots = vec![tmp.path().to_path_buf()];
        assert!(sanitize_path(&tmp.path().join("a/b.txt"), &roots).is_ok());
        assert!(sanitize_path(&tmp.path().join("../../etc/passwd"), &roots).is_err());
    }

    #[test]
    fn episode_location_from_narration_dir() {
        let loc = derive_episode_location(Path::new("/o/Topic/CS/ep03/narration"));
        assert_eq!(loc.topic, "Topic");
        assert_eq!(loc.lang, "CS");
        assert_eq!(loc.episode, "ep03");
        assert_eq!(loc.index, 3);
        assert_eq!(episode_number("episode_12"), 12);
        assert_eq!(episode_number("intro"), 0);
    }
}
