use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::OutlineError;
use super::citations::{SourceIndex, check_references};
use crate::lang::Language;

static MMSS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{1,2}:\d{2}$").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRuntime {
    #[serde(default)]
    pub segments: Vec<String>,
    pub sum_minutes: u32,
}

/// Main story point: one timed beat of an episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MspItem {
    pub timestamp: String,
    pub text: String,
    #[serde(default)]
    pub sources_segment: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub index: u32,
    pub title: String,
    #[serde(default)]
    pub description: Vec<String>,
    #[serde(default)]
    pub msp: Vec<MspItem>,
    pub runtime: EpisodeRuntime,
    pub viewer_takeaway: String,
    #[serde(default)]
    pub sources_used: Vec<String>,
    #[serde(default)]
    pub confidence_note: String,
}

impl Episode {
    pub fn validate(&self) -> Result<(), OutlineError> {
        let invalid = |msg: String| OutlineError::InvalidOutline(format!("episode {}: {msg}", self.index));
        if self.index < 1 {
            return Err(invalid("index must be >= 1".to_string()));
        }
        let title_len = self.title.chars().count();
        if title_len == 0 || title_len > 200 {
            return Err(invalid(format!("title must be 1..=200 chars, got {title_len}")));
        }
        if self.viewer_takeaway.is_empty() {
            return Err(invalid("viewer_takeaway must not be empty".to_string()));
        }
        if let Some(bad) = self.runtime.segments.iter().find(|s| !MMSS.is_match(s)) {
            return Err(invalid(format!("invalid segment format: {bad}. Expected mm:ss")));
        }
        if let Some(bad) = self.msp.iter().find(|m| !MMSS.is_match(&m.timestamp)) {
            return Err(invalid(format!("invalid timestamp format: {}. Expected mm:ss", bad.timestamp)));
        }

        let idx = SourceIndex::build(&self.sources_used);
        for (i, item) in self.msp.iter().enumerate() {
            check_references(i + 1, &item.sources_segment, &idx, &self.sources_used).map_err(invalid)?;
        }
        Ok(())
    }
}

/// A generated series outline for one language (`osnova.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineJson {
    pub language: Language,
    pub topic: String,
    pub series_title: String,
    #[serde(default)]
    pub series_context: Vec<String>,
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

impl OutlineJson {
    pub fn validate(&self) -> Result<(), OutlineError> {
        for (name, value) in [("topic", &self.topic), ("series_title", &self.series_title)] {
            let n = value.chars().count();
            if n == 0 || n > 200 {
                return Err(OutlineError::InvalidOutline(format!("{name} must be 1..=200 chars, got {n}")));
            }
        }
        if self.series_context.is_empty() {
            return Err(OutlineError::InvalidOutline(
                "series context must have at least one sentence".to_string(),
            ));
        }
        if self.episodes.is_empty() || self.episodes.len() > 50 {
            return Err(OutlineError::InvalidOutline(format!(
                "outline must have 1..=50 episodes, got {}",
                self.episodes.len()
            )));
        }
        let actual: Vec<u32> = self.episodes.iter().map(|e| e.index).collect();
        let expected: Vec<u32> = (1..=self.episodes.len() as u32).collect();
        if actual != expected {
            return Err(OutlineError::InvalidOutline(format!(
                "episode indices must be sequential starting from 1. Expected {expected:?}, got {actual:?}"
            )));
        }
        self.episodes.iter().try_for_each(Episode::validate)
    }

    pub fn total_runtime(&self) -> u32 {
        self.episodes.iter().map(|e| e.runtime.sum_minutes).sum()
    }

    pub fn total_msp_count(&self) -> usize {
        self.episodes.iter().map(|e| e.msp.len()).sum()
    }

    pub fn unique_sources(&self) -> Vec<String> {
        let set: BTreeSet<&String> = self.episodes.iter().flat_map(|e| e.sources_used.iter()).collect();
        set.into_iter().cloned().collect()
    }

    /// Plain-text rendering written next to the JSON as `osnova.txt`.
    pub fn to_text(&self) -> String {
        let mut lines = vec![self.series_title.clone(), String::new()];
        lines.extend(self.series_context.iter().map(|s| format!("- {s}")));
        lines.push(String::new());

        for ep in &self.episodes {
            lines.push(format!("Episode {}: {}", ep.index, ep.title));
            lines.extend(ep.description.iter().map(|d| format!("  - {d}")));
            for m in &ep.msp {
                lines.push(format!("    - [{}] {}", m.timestamp, m.text));
                if !m.sources_segment.is_empty() {
                    lines.push(format!("      Sources: {}", m.sources_segment.join(", ")));
                }
            }
            lines.push(format!("  Runtime: {} min ({})", ep.runtime.sum_minutes, ep.runtime.segments.join(", ")));
            lines.push(format!("  Takeaway: {}", ep.viewer_takeaway));
            lines.push(format!("  Sources Used: {}", ep.sources_used.join(", ")));
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "language": "CS",
            "topic": "Vznik Československa",
            "series_title": "Cesta k republice",
            "series_context": ["Rakousko-Uhersko se rozpadá.", "Vzniká nový stát."],
            "episodes": [
                {
                    "index": 1,
                    "title": "Válka a exil",
                    "description": ["Masaryk odchází do exilu.", "Začíná zahraniční odboj.", "Třetí věta."],
                    "msp": [
                        {"timestamp": "00:00", "text": "Odchod do exilu", "sources_segment": ["Masaryk, Světová revoluce"]},
                        {"timestamp": "20:00", "text": "Legie v Rusku", "sources_segment": ["Klimek, Boj o Hrad, pp. 10–20"]},
                        {"timestamp": "40:00", "text": "Washingtonská deklarace", "sources_segment": ["Masaryk, Světová revoluce"]}
                    ],
                    "runtime": {"segments": ["20:00", "20:00", "20:30"], "sum_minutes": 60},
                    "viewer_takeaway": "Odboj byl mezinárodní.",
                    "sources_used": ["Masaryk, Světová revoluce", "Klimek, Boj o Hrad, pp. 1–50"],
                    "confidence_note": ""
                }
            ]
        })
    }

    pub(crate) fn sample() -> OutlineJson {
        serde_json::from_value(sample_json()).unwrap()
    }

    #[test]
    fn sample_is_valid_and_helpers_count() {
        let o = sample();
        o.validate().unwrap();
        assert_eq!(o.total_runtime(), 60);
        assert_eq!(o.total_msp_count(), 3);
        assert_eq!(o.unique_sources(), vec!["Klimek, Boj o Hrad, pp. 1–50", "Masaryk, Světová revoluce"]);
    }

    #[test]
    fn indices_must_be_sequential() {
        let mut o = sample();
        o.episodes[0].index = 2;
        let err = o.validate().unwrap_err().to_string();
        assert!(err.contains("sequential"), "{err}");
    }

    #[test]
    fn bad_timestamp_and_unknown_source_fail() {
        let mut o = sample();
        o.episodes[0].msp[0].timestamp = "1:2".into();
        assert!(o.validate().unwrap_err().to_string().contains("timestamp"));

        let mut o = sample();
        o.episodes[0].msp[1].sources_segment = vec!["Wikipedia".into()];
        assert!(o.validate().unwrap_err().to_string().contains("unknown source"));
    }

    #[test]
    fn empty_context_is_rejected() {
        let mut o = sample();
        o.series_context.clear();
        assert!(o.validate().is_err());
    }

    #[test]
    fn text_rendering() {
        let text = sample().to_text();
        assert!(text.starts_with("Cesta k republice\n\n- Rakousko-Uhersko se rozpadá.\n"));
        assert!(text.contains("Episode 1: Válka a exil\n  - Masaryk odchází do exilu."));
        assert!(text.contains("    - [20:00] Legie v Rusku\n      Sources: Klimek, Boj o Hrad, pp. 10–20"));
        assert!(text.contains("  Runtime: 60 min (20:00, 20:00, 20:30)"));
        assert!(text.contains("  Takeaway: Odboj byl mezinárodní."));
    }
}
