//! Filesystem index of the prompts and narration roots: which topics,
//! languages and episodes exist, and which files each episode holds.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::args::IndexArgs;
use crate::events::{Event, emit};
use crate::paths::{PathResolver, Stage, normalize_name};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub fullpath: PathBuf,
    /// Seconds since the Unix epoch.
    pub mtime: f64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptEpisode {
    pub prompts: Vec<FileEntry>,
    pub expected_segments: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NarrationEpisode {
    pub segments: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageIndex<E> {
    pub episodes: BTreeMap<String, E>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicIndex<E> {
    pub languages: BTreeMap<String, LanguageIndex<E>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootIndex<E> {
    pub root: PathBuf,
    pub scanned_at: f64,
    pub topics: BTreeMap<String, TopicIndex<E>>,
}

impl<E> RootIndex<E> {
    fn empty(root: &Path) -> Self {
        Self { root: root.to_path_buf(), scanned_at: now_secs(), topics: BTreeMap::new() }
    }

    pub fn episode_count(&self) -> usize {
        self.topics.values().flat_map(|t| t.languages.values()).map(|l| l.episodes.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsIndex {
    pub prompts: RootIndex<PromptEpisode>,
    pub narration: RootIndex<NarrationEpisode>,
}

impl FsIndex {
    pub fn scan(prompts_root: &Path, narration_root: &Path, allowed_langs: Option<&[String]>) -> Self {
        Self { prompts: scan_prompts_root(prompts_root, allowed_langs), narration: scan_narration_root(narration_root) }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?).with_context(|| format!("writing {}", path.display()))
    }

    /// Saves over the index at `path` and returns the one it replaced.
    pub fn replace_at(&self, path: &Path) -> Result<Option<Self>> {
        let previous = Self::load(path);
        self.save(path)?;
        Ok(previous)
    }

    pub fn narrated_segment_count(&self) -> usize {
        self.narration
            .topics
            .values()
            .flat_map(|t| t.languages.values())
            .flat_map(|l| l.episodes.values())
            .map(|e| e.segments.len())
            .sum()
    }

    /// `None` when the file is missing or unreadable.
    pub fn load(path: &Path) -> Option<Self> {
        let raw = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!("ignoring unreadable index {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

fn sorted_dirs(path: &Path, keep: impl Fn(&str) -> bool) -> Vec<String> {
    let Ok(entries) = fs::read_dir(path) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| keep(n))
        .collect();
    names.sort();
    names
}

fn list_topics(root: &Path) -> Vec<String> {
    sorted_dirs(root, |n| !n.starts_with('.'))
}

fn list_episodes(lang_dir: &Path) -> Vec<String> {
    sorted_dirs(lang_dir, |n| n.to_lowercase().starts_with("ep"))
}

fn file_entries(dir: &Path, keep: impl Fn(&str) -> bool) -> Vec<FileEntry> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<FileEntry> = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            if !keep(&name) {
                return None;
            }
            let meta = e.metadata().ok().filter(|m| m.is_file())?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            Some(FileEntry { name, fullpath: e.path(), mtime, size: meta.len() })
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

fn expected_segments(ep_dir: &Path) -> usize {
    let path = ep_dir.join("meta").join("episode_context.json");
    let Ok(raw) = fs::read_to_string(&path) else {
        return 0;
    };
    serde_json::from_str::<serde_json::Value>(&raw)
        .ok()
        .and_then(|v| v.get("segments").and_then(|s| s.as_array()).map(Vec::len))
        .unwrap_or(0)
}

fn scan_tree<E>(
    root: &Path,
    keep_lang: impl Fn(&str) -> bool,
    episode: impl Fn(&Path) -> E,
) -> RootIndex<E> {
    let mut index = RootIndex::empty(root);
    if !root.is_dir() {
        debug!("{} does not exist, empty index", root.display());
        return index;
    }
    for topic in list_topics(root) {
        let topic_dir = root.join(&topic);
        let mut languages = BTreeMap::new();
        for lang in sorted_dirs(&topic_dir, &keep_lang) {
            let lang_dir = topic_dir.join(&lang);
            let episodes = list_episodes(&lang_dir).into_iter().map(|ep| {
                let data = episode(&lang_dir.join(&ep));
                (ep, data)
            });
            languages.insert(lang, LanguageIndex { episodes: episodes.collect() });
        }
        index.topics.insert(topic, TopicIndex { languages });
    }
    index
}

/// Topics → languages → episodes with their prompt files. `allowed_langs`
/// limits the language dirs considered.
pub fn scan_prompts_root(root: &Path, allowed_langs: Option<&[String]>) -> RootIndex<PromptEpisode> {
    scan_tree(
        root,
        |lang| allowed_langs.is_none_or(|allowed| allowed.iter().any(|a| a == lang)),
        |ep_dir| PromptEpisode {
            prompts: file_entries(&ep_dir.join("prompts"), |_| true),
            expected_segments: expected_segments(ep_dir),
        },
    )
}

pub fn scan_narration_root(root: &Path) -> RootIndex<NarrationEpisode> {
    scan_tree(
        root,
        |_| true,
        |ep_dir| NarrationEpisode {
            segments: file_entries(ep_dir, |n| n.starts_with("segment_") && n.to_lowercase().ends_with(".txt")),
        },
    )
}

/// Index key for a topic as displayed: the exact key, else a diacritics and
/// case insensitive match.
pub fn find_topic<'a, E>(display: &str, index: &'a RootIndex<E>) -> Option<&'a str> {
    if let Some((k, _)) = index.topics.get_key_value(display) {
        return Some(k.as_str());
    }
    let target = normalize_name(display);
    index.topics.keys().find(|k| normalize_name(k) == target).map(String::as_str)
}

pub fn run(args: &IndexArgs) -> Result<()> {
    emit(Event::phase("scanning"));
    let prompts_root = args.prompts_root.clone().unwrap_or_else(|| PathResolver::root(Stage::Prompts));
    let narration_root = args.narration_root.clone().unwrap_or_else(|| PathResolver::root(Stage::Narration));
    let allowed: Vec<String> = args.languages.iter().map(|l| l.code().to_string()).collect();
    let index = FsIndex::scan(&prompts_root, &narration_root, (!allowed.is_empty()).then_some(allowed.as_slice()));

    for (topic, t) in &index.prompts.topics {
        for (lang, l) in &t.languages {
            for (ep, e) in &l.episodes {
                let written = find_topic(topic, &index.narration)
                    .and_then(|k| index.narration.topics.get(k))
                    .and_then(|nt| nt.languages.get(lang))
                    .and_then(|nl| nl.episodes.get(ep))
                    .map_or(0, |ne| ne.segments.len());
                println!(
                    "{topic}/{lang}/{ep}: {} prompt file(s), {written}/{} segment(s) narrated",
                    e.prompts.len(),
                    e.expected_segments
                );
            }
        }
    }
    info!(
        "indexed {} prompt episode(s) under {} and {} narration episode(s) under {}",
        index.prompts.episode_count(),
        prompts_root.display(),
        index.narration.episode_count(),
        narration_root.display()
    );
    if let Some(path) = &args.save {
        if let Some(previous) = index.replace_at(path)? {
            info!(
                "narrated segments since last index: {} -> {}",
                previous.narrated_segment_count(),
                index.narrated_segment_count()
            );
        }
        emit(Event::OutputPath { value: path.display().to_string() });
    }
    emit(Event::Done);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, body: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn prompts_tree_is_indexed() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("prompts");
        let ep = root.join("Husité").join("CS").join("ep01");
        write(&ep.join("prompts").join("msp_02_execution.txt"), "b");
        write(&ep.join("prompts").join("msp_01_execution.txt"), "aa");
        write(&ep.join("meta").join("episode_context.json"), r#"{"segments":[{},{},{}]}"#);
        fs::create_dir_all(root.join("Husité").join("EN").join("ep01")).unwrap();
        fs::create_dir_all(root.join("Husité").join("CS").join("notes")).unwrap();
        fs::create_dir_all(root.join(".cache").join("CS").join("ep01")).unwrap();

        let index = scan_prompts_root(&root, Some(&["CS".to_string()]));
        assert_eq!(index.topics.keys().collect::<Vec<_>>(), vec!["Husité"]);
        let langs = &index.topics["Husité"].languages;
        assert_eq!(langs.keys().collect::<Vec<_>>(), vec!["CS"]);
        let episode = &langs["CS"].episodes["ep01"];
        assert_eq!(episode.expected_segments, 3);
        let names: Vec<&str> = episode.prompts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["msp_01_execution.txt", "msp_02_execution.txt"]);
        assert_eq!(episode.prompts[0].size, 2);
        assert_eq!(index.episode_count(), 1);
    }

    #[test]
    fn narration_segments_and_topic_lookup() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("narration");
        let ep = root.join("Velká válka").join("CS").join("ep01");
        write(&ep.join("segment_01.txt"), "x");
        write(&ep.join("segment_01.txt.bak_20250101_000000"), "x");
        write(&ep.join("fusion_result.txt"), "x");

        let index = scan_narration_root(&root);
        let segments = &index.topics["Velká válka"].languages["CS"].episodes["ep01"].segments;
        assert_eq!(segments.len(), 1);
        assert_eq!(find_topic("Velká válka", &index), Some("Velká válka"));
        assert_eq!(find_topic("velka valka", &index), Some("Velká válka"));
        assert_eq!(find_topic("jiné", &index), None);
    }

    #[test]
    fn index_survives_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let index = FsIndex::scan(&tmp.path().join("missing"), &tmp.path().join("missing2"), None);
        assert!(index.prompts.topics.is_empty());
        let path = tmp.path().join("idx").join("index.json");
        index.save(&path).unwrap();
        let loaded = FsIndex::load(&path).unwrap();
        assert_eq!(loaded.prompts.root, index.prompts.root);
        assert_eq!(loaded.narration.topics, index.narration.topics);
        assert_eq!(FsIndex::load(&tmp.path().join("nope.json")), None);
    }

    #[test]
    fn replacing_a_saved_index_returns_the_previous_one() {
        let tmp = TempDir::new().unwrap();
        let narration = tmp.path().join("narration");
        let prompts = tmp.path().join("prompts");
        let path = tmp.path().join("index.json");
        write(&narration.join("Husité").join("CS").join("ep01").join("segment_01.txt"), "x");

        let first = FsIndex::scan(&prompts, &narration, None);
        assert_eq!(first.replace_at(&path).unwrap(), None);

        write(&narration.join("Husité").join("CS").join("ep01").join("segment_02.txt"), "y");
        let second = FsIndex::scan(&prompts, &narration, None);
        let previous = second.replace_at(&path).unwrap().unwrap();
        assert_eq!(previous.narrated_segment_count(), 1);
        assert_eq!(second.narrated_segment_count(), 2);
        assert_eq!(FsIndex::load(&path).unwrap().narrated_segment_count(), 2);
    }
}
