use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::OutlineError;
use crate::lang::Language;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRange {
    pub min: u32,
    pub max: u32,
}

impl CountRange {
    fn check(&self, name: &str, lo: u32, hi: u32) -> Result<(), OutlineError> {
        for (field, v) in [("min", self.min), ("max", self.max)] {
            if !(lo..=hi).contains(&v) {
                return Err(OutlineError::InvalidConfig(format!("{name}.{field} must be in {lo}..={hi}, got {v}")));
            }
        }
        if self.min > self.max {
            return Err(OutlineError::InvalidConfig(format!(
                "{name}: min ({}) must be <= max ({})",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// `"auto"` or a fixed count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EpisodeCount {
    Fixed(u32),
    Named(String),
}

impl Default for EpisodeCount {
    fn default() -> Self {
        EpisodeCount::Named("auto".to_string())
    }
}

impl fmt::Display for EpisodeCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpisodeCount::Fixed(n) => write!(f, "{n}"),
            EpisodeCount::Named(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ordering {
    #[default]
    Chronological,
    Thematic,
}

impl Ordering {
    pub fn as_str(self) -> &'static str {
        match self {
            Ordering::Chronological => "chronological",
            Ordering::Thematic => "thematic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceFormat {
    #[default]
    NameOnly,
    WithUrl,
    FullCitation,
}

impl SourceFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceFormat::NameOnly => "name-only",
            SourceFormat::WithUrl => "with-url",
            SourceFormat::FullCitation => "full-citation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub per_episode: CountRange,
    #[serde(default)]
    pub format: SourceFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FactualityRules {
    pub no_dialogue: bool,
    pub no_speculation: bool,
    pub consensus_only: bool,
    pub note_disputes_briefly: bool,
}

impl Default for FactualityRules {
    fn default() -> Self {
        Self { no_dialogue: true, no_speculation: true, consensus_only: true, note_disputes_briefly: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Markers {
    pub begin_template: String,
    pub end_template: String,
    pub bullet: String,
}

impl Default for Markers {
    fn default() -> Self {
        Self {
            begin_template: "===BEGIN_SECTION:{LANG}===".to_string(),
            end_template: "===END_SECTION:{LANG}===".to_string(),
            bullet: "-".to_string(),
        }
    }
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    6000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlineConfig {
    pub topic: String,
    pub languages: Vec<Language>,
    #[serde(default)]
    pub episodes: EpisodeCount,
    pub episode_minutes: u32,
    pub episode_count_range: CountRange,
    pub msp_per_episode: u32,
    pub msp_max_words: u32,
    pub description_max_sentences: u32,
    pub series_context_sentences: CountRange,
    #[serde(default)]
    pub ordering: Ordering,
    pub tolerance_min: u32,
    pub tolerance_max: u32,
    #[serde(default)]
    pub markers: Markers,
    #[serde(default)]
    pub factuality: FactualityRules,
    pub sources: SourcesConfig,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

const LEGACY_KEYS: &[(&str, &str)] = &[
    ("LANGUAGES", "languages"),
    ("TOPIC", "topic"),
    ("EPISODES", "episodes"),
    ("EPISODE_MINUTES", "episode_minutes"),
    ("EPISODE_COUNT_RANGE", "episode_count_range"),
    ("MSP_PER_EPISODE", "msp_per_episode"),
    ("MSP_MAX_WORDS", "msp_max_words"),
    ("DESCRIPTION_MAX_SENTENCES", "description_max_sentences"),
    ("SERIES_CONTEXT_SENTENCES", "series_context_sentences"),
    ("ORDERING", "ordering"),
    ("TOLERANCE_MIN", "tolerance_min"),
    ("TOLERANCE_MAX", "tolerance_max"),
    ("MARKERS", "markers"),
    ("FACTUALITY", "factuality"),
];

/// Renames the upper-case keys older config files used.
fn remap_legacy_keys(data: &mut serde_json::Map<String, serde_json::Value>) {
    for (old, new) in LEGACY_KEYS {
        if let Some(v) = data.remove(*old) {
            data.insert(new.to_string(), v);
        }
    }
    if let Some(mut sources) = data.remove("SOURCES") {
        if let Some(obj) = sources.as_object_mut() {
            if let Some(v) = obj.remove("PER_EPISODE") {
                obj.insert("per_episode".to_string(), v);
            }
            if let Some(v) = obj.remove("FORMAT") {
                obj.insert("format".to_string(), v);
            }
        }
        data.insert("sources".to_string(), sources);
    }
    // Output layout settings are not configurable here.
    data.remove("OUTPUT");
    data.remove("output");
}

impl OutlineConfig {
    pub fn load(path: &Path) -> Result<Self, OutlineError> {
        Self::load_with(path, |k| std::env::var(k).ok())
    }

    pub fn load_with<F>(path: &Path, lookup: F) -> Result<Self, OutlineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if !path.exists() {
            return Err(OutlineError::ConfigNotFound(path.to_path_buf()));
        }
        let raw = fs::read_to_string(path)?;
        let mut cfg = Self::from_json_str(&raw)?;
        cfg.apply_env(lookup)?;
        cfg.validate()?;
        debug!("loaded outline config for {:?} from {}", cfg.topic, path.display());
        Ok(cfg)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, OutlineError> {
        let mut value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| OutlineError::InvalidConfig(e.to_string()))?;
        let Some(map) = value.as_object_mut() else {
            return Err(OutlineError::InvalidConfig("config root must be a JSON object".to_string()));
        };
        remap_legacy_keys(map);
        serde_json::from_value(value).map_err(|e| OutlineError::InvalidConfig(e.to_string()))
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), OutlineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(m) = lookup("GPT_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model = m.trim().to_string();
        }
        if let Some(t) = lookup("GPT_TEMPERATURE") {
            self.temperature = t
                .trim()
                .parse()
                .map_err(|_| OutlineError::InvalidConfig(format!("GPT_TEMPERATURE is not a number: {t:?}")))?;
        }
        if let Some(n) = lookup("GPT_MAX_TOKENS") {
            self.max_tokens = n
                .trim()
                .parse()
                .map_err(|_| OutlineError::InvalidConfig(format!("GPT_MAX_TOKENS is not an integer: {n:?}")))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), OutlineError> {
        let invalid = |msg: String| Err(OutlineError::InvalidConfig(msg));
        let topic_len = self.topic.chars().count();
        if topic_len == 0 || topic_len > 200 {
            return invalid(format!("topic must be 1..=200 chars, got {topic_len}"));
        }
        if self.languages.is_empty() {
            return invalid("languages must not be empty".to_string());
        }
        match &self.episodes {
            EpisodeCount::Fixed(n) if !(1..=50).contains(n) => {
                return invalid(format!("episode count must be between 1 and 50, got {n}"));
            }
            EpisodeCount::Named(s) if s != "auto" => {
                return invalid(format!("episodes must be \"auto\" or a number, got {s:?}"));
            }
            _ => {}
        }
        let bounded = [
            ("episode_minutes", self.episode_minutes, 10, 180),
            ("msp_per_episode", self.msp_per_episode, 3, 10),
            ("msp_max_words", self.msp_max_words, 5, 50),
            ("description_max_sentences", self.description_max_sentences, 1, 10),
        ];
        for (name, v, lo, hi) in bounded {
            if !(lo..=hi).contains(&v) {
                return invalid(format!("{name} must be in {lo}..={hi}, got {v}"));
            }
        }
        self.episode_count_range.check("episode_count_range", 1, 50)?;
        self.series_context_sentences.check("series_context_sentences", 1, 10)?;
        self.sources.per_episode.check("sources.per_episode", 1, 50)?;

        if self.tolerance_min < 1 || self.tolerance_max < 1 {
            return invalid("tolerances must be >= 1".to_string());
        }
        if self.tolerance_min > self.tolerance_max {
            return invalid(format!(
                "tolerance_min ({}) must be <= tolerance_max ({})",
                self.tolerance_min, self.tolerance_max
            ));
        }
        if self.tolerance_max + 10 < self.episode_minutes {
            return invalid(format!(
                "tolerance_max ({}) is too far from episode_minutes ({})",
                self.tolerance_max, self.episode_minutes
            ));
        }
        if self.tolerance_min > self.episode_minutes + 10 {
            return invalid(format!(
                "tolerance_min ({}) is too far from episode_minutes ({})",
                self.tolerance_min, self.episode_minutes
            ));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return invalid(format!("temperature must be in 0..=2, got {}", self.temperature));
        }
        if !(100..=10000).contains(&self.max_tokens) {
            return invalid(format!("max_tokens must be in 100..=10000, got {}", self.max_tokens));
        }
        Ok(())
    }

    /// Placeholder values for the outline template: every field under its
    /// dotted path, plus the upper-case aliases older templates use.
    /// `LANG` stays as the literal `{LANG}` and is filled per language.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        if let Ok(value) = serde_json::to_value(self) {
            walk("", &value, &mut out);
        }

        let aliases = [
            ("TOPIC", self.topic.clone()),
            ("LANG", "{LANG}".to_string()),
            ("EPISODES", self.episodes.to_string()),
            ("EPISODE_MINUTES", self.episode_minutes.to_string()),
            ("MSP_PER_EPISODE", self.msp_per_episode.to_string()),
            ("MSP_MAX_WORDS", self.msp_max_words.to_string()),
            ("DESCRIPTION_MAX_SENTENCES", self.description_max_sentences.to_string()),
            ("ORDERING", self.ordering.as_str().to_string()),
            ("TOLERANCE_MIN", self.tolerance_min.to_string()),
            ("TOLERANCE_MAX", self.tolerance_max.to_string()),
            ("EPISODE_COUNT_RANGE.min", self.episode_count_range.min.to_string()),
            ("EPISODE_COUNT_RANGE.max", self.episode_count_range.max.to_string()),
            ("SERIES_CONTEXT_SENTENCES.min", self.series_context_sentences.min.to_string()),
            ("SERIES_CONTEXT_SENTENCES.max", self.series_context_sentences.max.to_string()),
            ("SOURCES.PER_EPISODE.min", self.sources.per_episode.min.to_string()),
            ("SOURCES.PER_EPISODE.max", self.sources.per_episode.max.to_string()),
            ("SOURCES.FORMAT", self.sources.format.as_str().to_string()),
            ("MARKERS.BEGIN_TEMPLATE", self.markers.begin_template.clone()),
            ("MARKERS.END_TEMPLATE", self.markers.end_template.clone()),
            ("MARKERS.BULLET", self.markers.bullet.clone()),
            ("FACTUALITY.NO_DIALOGUE", self.factuality.no_dialogue.to_string()),
            ("FACTUALITY.NO_SPECULATION", self.factuality.no_speculation.to_string()),
            ("FACTUALITY.CONSENSUS_ONLY", self.factuality.consensus_only.to_string()),
            ("FACTUALITY.NOTE_DISPUTES_BRIEFLY", self.factuality.note_disputes_briefly.to_string()),
        ];
        for (k, v) in aliases {
            out.insert(k.to_string(), v);
        }
        out
    }
}

fn walk(prefix: &str, value: &serde_json::Value, out: &mut BTreeMap<String, String>) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}.{k}") };
                walk(&key, v, out);
            }
        }
        Value::Array(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            out.insert(prefix.to_string(), parts.join(", "));
        }
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) const SAMPLE: &str = r#"{
        "topic": "Vznik Československa",
        "languages": ["CS", "EN"],
        "episodes": "auto",
        "episode_minutes": 60,
        "episode_count_range": {"min": 3, "max": 6},
        "msp_per_episode": 3,
        "msp_max_words": 20,
        "description_max_sentences": 2,
        "series_context_sentences": {"min": 2, "max": 4},
        "ordering": "chronological",
        "tolerance_min": 55,
        "tolerance_max": 65,
        "sources": {"per_episode": {"min": 1, "max": 3}, "format": "name-only"}
    }"#;

    pub(crate) fn sample() -> OutlineConfig {
        OutlineConfig::from_json_str(SAMPLE).unwrap()
    }

    #[test]
    fn parses_and_validates_sample() {
        let cfg = sample();
        cfg.validate().unwrap();
        assert_eq!(cfg.languages, vec![Language::Cs, Language::En]);
        assert_eq!(cfg.episodes, EpisodeCount::Named("auto".into()));
        assert_eq!(cfg.model, "gpt-4.1-mini");
        assert_eq!(cfg.max_tokens, 6000);
        assert!(cfg.factuality.no_dialogue);
    }

    #[test]
    fn legacy_keys_are_remapped() {
        let raw = r#"{
            "TOPIC": "Bitva u Slavkova",
            "LANGUAGES": ["DE"],
            "EPISODES": 4,
            "EPISODE_MINUTES": 30,
            "EPISODE_COUNT_RANGE": {"min": 1, "max": 5},
            "MSP_PER_EPISODE": 5,
            "MSP_MAX_WORDS": 15,
            "DESCRIPTION_MAX_SENTENCES": 3,
            "SERIES_CONTEXT_SENTENCES": {"min": 1, "max": 3},
            "ORDERING": "thematic",
            "TOLERANCE_MIN": 25,
            "TOLERANCE_MAX": 35,
            "SOURCES": {"PER_EPISODE": {"min": 2, "max": 4}, "FORMAT": "with-url"},
            "OUTPUT": {"mode": "multi-file"}
        }"#;
        let cfg = OutlineConfig::from_json_str(raw).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.topic, "Bitva u Slavkova");
        assert_eq!(cfg.episodes, EpisodeCount::Fixed(4));
        assert_eq!(cfg.ordering, Ordering::Thematic);
        assert_eq!(cfg.sources.format, SourceFormat::WithUrl);
        assert_eq!(cfg.sources.per_episode.max, 4);
    }

    #[test]
    fn tolerance_rules() {
        let mut cfg = sample();
        cfg.tolerance_min = 70;
        assert!(matches!(cfg.validate(), Err(OutlineError::InvalidConfig(_))));

        let mut cfg = sample();
        cfg.tolerance_min = 20;
        cfg.tolerance_max = 45;
        assert!(cfg.validate().unwrap_err().to_string().contains("too far"));

        let mut cfg = sample();
        cfg.episodes = EpisodeCount::Fixed(51);
        assert!(cfg.validate().is_err());
        cfg.episodes = EpisodeCount::Named("many".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_model_settings() {
        let mut cfg = sample();
        cfg.apply_env(|k| match k {
            "GPT_MODEL" => Some("gpt-4.1".into()),
            "GPT_MAX_TOKENS" => Some("4000".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.model, "gpt-4.1");
        assert_eq!(cfg.max_tokens, 4000);
        assert!(cfg.apply_env(|k| (k == "GPT_TEMPERATURE").then(|| "warm".to_string())).is_err());
    }

    #[test]
    fn flatten_has_dotted_keys_and_aliases() {
        let flat = sample().flatten();
        assert_eq!(flat["topic"], "Vznik Československa");
        assert_eq!(flat["languages"], "CS, EN");
        assert_eq!(flat["sources.per_episode.min"], "1");
        assert_eq!(flat["LANG"], "{LANG}");
        assert_eq!(flat["EPISODES"], "auto");
        assert_eq!(flat["MARKERS.BEGIN_TEMPLATE"], "===BEGIN_SECTION:{LANG}===");
        assert_eq!(flat["FACTUALITY.NO_DIALOGUE"], "true");
        assert_eq!(flat["SOURCES.FORMAT"], "name-only");
    }

    #[test]
    fn missing_file_is_reported() {
        let tmp = TempDir::new().unwrap();
        let err = OutlineConfig::load_with(&tmp.path().join("none.json"), |_| None).unwrap_err();
        assert!(matches!(err, OutlineError::ConfigNotFound(_)));
    }
}
