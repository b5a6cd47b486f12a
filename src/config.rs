//! Application settings loaded from `narration.toml` plus environment overrides.
//!
//! API keys never live in the TOML file; they are read from the environment
//! (optionally seeded from `.env` at startup).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::lang::Language;

pub const DEFAULT_CONFIG_FILE: &str = "narration.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub openai: OpenAiSettings,
    pub anthropic: AnthropicSettings,
    pub elevenlabs: ElevenLabsSettings,
    pub postprocess: PostprocessSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.4,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicSettings {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_attempts: u32,
    pub word_tolerance_percent: u32,
    pub rate_limit_delay_secs: f64,
    pub max_parallel_segments: usize,
    pub timeout_secs: u64,
}

impl Default for AnthropicSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-opus-4-1-20250805".to_string(),
            temperature: 0.3,
            max_tokens: 8000,
            max_attempts: 3,
            word_tolerance_percent: 3,
            rate_limit_delay_secs: 3.0,
            max_parallel_segments: 3,
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
    pub speed: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self { stability: 0.5, similarity_boost: 0.5, style: 0.0, use_speaker_boost: true, speed: 1.0 }
    }
}

/// Sparse per-language override of [`VoiceSettings`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceOverride {
    pub stability: Option<f32>,
    pub similarity_boost: Option<f32>,
    pub style: Option<f32>,
    pub use_speaker_boost: Option<bool>,
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevenLabsSettings {
    pub base_url: String,
    pub model: String,
    pub output_format: String,
    pub voice_settings: VoiceSettings,
    /// Keyed by language code, e.g. `CS = "abc123"`.
    pub voice_ids: HashMap<String, String>,
    pub language_voice_settings: HashMap<String, VoiceOverride>,
}

impl Default for ElevenLabsSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.elevenlabs.io".to_string(),
            model: "eleven_multilingual_v2".to_string(),
            output_format: "mp3_44100_128".to_string(),
            voice_settings: VoiceSettings::default(),
            voice_ids: HashMap::new(),
            language_voice_settings: HashMap::new(),
        }
    }
}

impl ElevenLabsSettings {
    pub fn voice_id(&self, lang: Language) -> Option<&str> {
        self.voice_ids
            .get(lang.code())
            .or_else(|| self.voice_ids.get(&lang.lower()))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn voice_settings_for(&self, lang: Language) -> VoiceSettings {
        let mut vs = self.voice_settings;
        let o = self
            .language_voice_settings
            .get(lang.code())
            .or_else(|| self.language_voice_settings.get(&lang.lower()));
        if let Some(o) = o {
            if let Some(v) = o.stability {
                vs.stability = v;
            }
            if let Some(v) = o.similarity_boost {
                vs.similarity_boost = v;
            }
            if let Some(v) = o.style {
                vs.style = v;
            }
            if let Some(v) = o.use_speaker_boost {
                vs.use_speaker_boost = v;
            }
            if let Some(v) = o.speed {
                vs.speed = v;
            }
        }
        vs
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostprocessSettings {
    pub output_base: Option<PathBuf>,
    pub concurrency: usize,
}

impl Default for PostprocessSettings {
    fn default() -> Self {
        Self { output_base: None, concurrency: 3 }
    }
}

impl AppConfig {
    /// Missing file yields defaults; a malformed file is a validation error.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let cfg: AppConfig = toml::from_str(&raw)
            .map_err(|e| PipelineError::Validation(format!("{}: {e}", path.display())))?;
        Ok(cfg)
    }

    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut cfg = Self::load_from(&path)?;
        cfg.apply_env(|k| std::env::var(k).ok());
        Ok(cfg)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GPT_MODEL").filter(|v| !v.is_empty()) {
            self.openai.model = v;
        }
        override_parsed(&lookup, "GPT_TEMPERATURE", &mut self.openai.temperature);
        if let Some(v) = lookup("CLAUDE_MODEL").filter(|v| !v.is_empty()) {
            self.anthropic.model = v;
        }
        override_parsed(&lookup, "CLAUDE_TEMPERATURE", &mut self.anthropic.temperature);
        override_parsed(&lookup, "CLAUDE_MAX_TOKENS", &mut self.anthropic.max_tokens);
        override_parsed(&lookup, "MAX_ATTEMPTS", &mut self.anthropic.max_attempts);
        override_parsed(&lookup, "WORD_TOLERANCE", &mut self.anthropic.word_tolerance_percent);
        override_parsed(&lookup, "RATE_LIMIT_DELAY", &mut self.anthropic.rate_limit_delay_secs);
        override_parsed(&lookup, "MAX_PARALLEL_SEGMENTS", &mut self.anthropic.max_parallel_segments);
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!("ignoring unparsable {}={:?}", key, raw),
        }
    }
}

pub fn api_key(var: &str) -> Option<String> {
    std::env::var(var).ok().map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
}

pub fn require_api_key(var: &str) -> Result<String, PipelineError> {
    api_key(var).ok_or_else(|| PipelineError::Validation(format!("{var} is not set")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.anthropic.max_attempts, 3);
        assert_eq!(cfg.elevenlabs.model, "eleven_multilingual_v2");
        assert_eq!(cfg.postprocess.concurrency, 3);
    }

    #[test]
    fn partial_file_and_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("narration.toml");
        fs::write(
            &path,
            r#"
[elevenlabs]
output_format = "pcm_22050"

[elevenlabs.voice_ids]
CS = "voice-cs"

[elevenlabs.language_voice_settings.CS]
speed = 0.9
"#,
        )
        .unwrap();
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.elevenlabs.output_format, "pcm_22050");
        assert_eq!(cfg.elevenlabs.voice_id(Language::Cs), Some("voice-cs"));
        assert_eq!(cfg.elevenlabs.voice_id(Language::En), None);
        let vs = cfg.elevenlabs.voice_settings_for(Language::Cs);
        assert_eq!(vs.speed, 0.9);
        assert_eq!(vs.stability, 0.5);
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let mut cfg = AppConfig::default();
        cfg.apply_env(|k| match k {
            "CLAUDE_MODEL" => Some("claude-test".into()),
            "MAX_ATTEMPTS" => Some("5".into()),
            "RATE_LIMIT_DELAY" => Some("not-a-number".into()),
            _ => None,
        });
        assert_eq!(cfg.anthropic.model, "claude-test");
        assert_eq!(cfg.anthropic.max_attempts, 5);
        assert_eq!(cfg.anthropic.rate_limit_delay_secs, 3.0);
    }

    #[test]
    fn malformed_file_is_validation_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        fs::write(&path, "[openai\nmodel=").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), crate::error::EXIT_VALIDATION);
    }
}
