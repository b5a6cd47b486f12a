use serde::{Deserialize, Serialize};

use crate::lang::Language;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeContext {
    pub series_title: String,
    pub series_context: Vec<String>,
    pub episode_title: String,
    pub episode_description: Vec<String>,
    pub episode_index: u32,
    pub total_episodes: u32,
    pub language: Language,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Gpt,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedText {
    pub text: String,
    pub provenance: Provenance,
    pub prompt_hash: Option<String>,
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub model: String,
    pub temperature_intro: f32,
    pub temperature_transition: f32,
    pub max_tokens_intro: u32,
    pub max_tokens_transition: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature_intro: 0.7,
            temperature_transition: 0.7,
            max_tokens_intro: 500,
            max_tokens_transition: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormatterConfig {
    pub language: Language,
    pub use_gpt_split: bool,
    pub use_gpt_grammar: bool,
    pub temperature_split: f32,
    pub temperature_grammar: f32,
    pub model: String,
    /// Replace `...` with a single `…`.
    pub use_single_ellipsis_char: bool,
    /// Replace a spaced hyphen with ` – `.
    pub use_en_dash_for_aside: bool,
    /// Split over-long sentences instead of only warning about them.
    pub strict_sentence_split: bool,
    pub max_sentence_words: usize,
    pub min_sentence_words: usize,
}

impl FormatterConfig {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            use_gpt_split: true,
            use_gpt_grammar: true,
            temperature_split: 0.3,
            temperature_grammar: 0.2,
            model: "gpt-4o".to_string(),
            use_single_ellipsis_char: true,
            use_en_dash_for_aside: true,
            strict_sentence_split: false,
            max_sentence_words: 30,
            min_sentence_words: 20,
        }
    }

    pub fn offline(language: Language) -> Self {
        Self { use_gpt_split: false, use_gpt_grammar: false, ..Self::new(language) }
    }

    pub fn uses_editor(&self) -> bool {
        self.use_gpt_split || self.use_gpt_grammar
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_disables_editor_only() {
        let cfg = FormatterConfig::offline(Language::De);
        assert!(!cfg.uses_editor());
        assert_eq!(cfg.max_sentence_words, 30);
        assert!(FormatterConfig::new(Language::De).uses_editor());
    }

    #[test]
    fn provenance_serializes_lowercase() {
        let g = GeneratedText { text: "x".into(), provenance: Provenance::Fallback, prompt_hash: None, meta: None };
        let v = serde_json::to_value(&g).unwrap();
        assert_eq!(v["provenance"], "fallback");
    }
}
