use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use clap::ValueEnum;
use regex::{Captures, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::lang::Language;
use crate::narration_core::numerals::spell_cardinal;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static GLUED_PERIOD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.([A-Z])").unwrap());
static SMALL_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(10|[1-9])\b").unwrap());
static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(1[0-9]{3}|20[0-9]{2})\b").unwrap());
static PY_BACKREF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\\(\d+)").unwrap());

const CS_SMALL: [&str; 10] = ["jeden", "dva", "tři", "čtyři", "pět", "šest", "sedm", "osm", "devět", "deset"];

const CS_ABBREVIATIONS: [(&str, &str); 7] = [
    ("např.", "například"),
    ("tj.", "to jest"),
    ("tzv.", "takzvaný"),
    ("atd.", "a tak dále"),
    ("apod.", "a podobně"),
    ("č.", "číslo"),
    ("str.", "strana"),
];

static CS_ABBREVIATION_RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    CS_ABBREVIATIONS
        .iter()
        .map(|(abbr, full)| (Regex::new(&format!(r"\b{}", regex::escape(abbr))).unwrap(), *full))
        .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Minimal,
    #[default]
    Default,
    Aggressive,
}

impl Preset {
    pub fn as_str(self) -> &'static str {
        match self {
            Preset::Minimal => "minimal",
            Preset::Default => "default",
            Preset::Aggressive => "aggressive",
        }
    }

    /// `lang` picks the language years are spelled in for the aggressive preset.
    pub fn apply(self, text: &str, lang: Language) -> String {
        let cleaned = clean(text);
        match self {
            Preset::Minimal => cleaned,
            Preset::Default => prepare_for_tts(&cleaned),
            Preset::Aggressive => years_to_words(&prepare_for_tts(&cleaned), lang),
        }
    }
}

/// Collapses whitespace and puts a space after a period glued to a capital.
pub fn clean(text: &str) -> String {
    let t = WHITESPACE.replace_all(text, " ");
    GLUED_PERIOD.replace_all(t.trim(), ". $1").into_owned()
}

/// Spells standalone 1..=10 and expands common Czech abbreviations.
pub fn prepare_for_tts(text: &str) -> String {
    let mut t = SMALL_NUMBER
        .replace_all(text, |c: &Captures| {
            let n: usize = c[1].parse().unwrap_or(0);
            CS_SMALL.get(n.wrapping_sub(1)).map(|w| w.to_string()).unwrap_or_else(|| c[0].to_string())
        })
        .into_owned();
    for (re, full) in CS_ABBREVIATION_RULES.iter() {
        t = re.replace_all(&t, *full).into_owned();
    }
    t
}

pub fn years_to_words(text: &str, lang: Language) -> String {
    YEAR.replace_all(text, |c: &Captures| {
        c[1].parse::<u32>().ok().and_then(|y| spell_cardinal(y, lang)).unwrap_or_else(|| c[0].to_string())
    })
    .into_owned()
}

#[derive(Debug, Clone, Deserialize)]
struct RuleSpec {
    pattern: String,
    #[serde(default)]
    replacement: String,
    #[serde(default)]
    flags: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

/// Extra regex rewrites loaded from a JSON rules file.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub name: Option<String>,
    rules: Vec<(Regex, String)>,
}

/// Rules files use `\1` backreferences; the regex crate wants `${1}`.
fn convert_replacement(repl: &str) -> String {
    let escaped = repl.replace('$', "$$");
    PY_BACKREF.replace_all(&escaped, "$${$1}").into_owned()
}

impl RuleSet {
    pub fn from_json(raw: &str) -> Result<Self, PipelineError> {
        let file: RulesFile =
            serde_json::from_str(raw).map_err(|e| PipelineError::Validation(format!("invalid rules file: {e}")))?;
        let mut rules = Vec::with_capacity(file.rules.len());
        for spec in file.rules {
            let compiled = RegexBuilder::new(&spec.pattern).case_insensitive(spec.flags.contains('i')).build();
            match compiled {
                Ok(re) => rules.push((re, convert_replacement(&spec.replacement))),
                Err(e) => warn!("skipping rule {:?}: {}", spec.pattern, e),
            }
        }
        debug!("loaded {} rewrite rules", rules.len());
        Ok(Self { name: file.name, rules })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading rules {}", path.display()))?;
        Ok(Self::from_json(&raw)?)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (re, repl) in &self.rules {
            out = re.replace_all(&out, repl.as_str()).into_owned();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_collapses_and_separates_sentences() {
        assert_eq!(clean("  První věta.Druhá   věta\n\n"), "První věta. Druhá věta");
        assert_eq!(clean("verze 2.0 zůstává"), "verze 2.0 zůstává");
    }

    #[test]
    fn small_numbers_and_abbreviations() {
        assert_eq!(prepare_for_tts("Přišli 3 muži, tj. 10 let"), "Přišli tři muži, to jest deset let");
        assert_eq!(prepare_for_tts("např. 12 lidí"), "například 12 lidí");
        assert_eq!(prepare_for_tts("viz č. 5"), "viz číslo pět");
    }

    #[test]
    fn abbreviation_needs_word_start() {
        assert_eq!(prepare_for_tts("Nakonec."), "Nakonec.");
        assert_eq!(prepare_for_tts("koneč. verze"), "koneč. verze");
    }

    #[test]
    fn presets_stack() {
        let text = "V roce 1918 vznikl stát, tzv. republika.";
        assert_eq!(Preset::Minimal.apply(text, Language::Cs), text);
        assert_eq!(Preset::Default.apply(text, Language::Cs), "V roce 1918 vznikl stát, takzvaný republika.");
        let aggressive = Preset::Aggressive.apply(text, Language::Cs);
        assert!(!aggressive.contains("1918"));
        assert!(aggressive.starts_with("V roce tisíc"));
    }

    #[test]
    fn rules_apply_in_order_and_skip_bad_patterns() {
        let raw = r#"{"name":"demo","rules":[
            {"pattern":"(\\w+)ová","replacement":"\\1ova"},
            {"pattern":"[unclosed","replacement":"x"},
            {"pattern":"praha","replacement":"Praha","flags":"i"}
        ]}"#;
        let rules = RuleSet::from_json(raw).unwrap();
        assert_eq!(rules.name.as_deref(), Some("demo"));
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.apply("Nováková, PRAHA"), "Novákova, Praha");
    }

    #[test]
    fn dollar_in_replacement_is_literal() {
        let rules = RuleSet::from_json(r#"{"rules":[{"pattern":"USD","replacement":"$"}]}"#).unwrap();
        assert_eq!(rules.apply("5 USD"), "5 $");
    }
}
