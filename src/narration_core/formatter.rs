//! Prepares narration text for text-to-speech.
//!
//! The offline pipeline normalizes whitespace, strips citations, expands
//! abbreviations, spells out numbers, fixes punctuation and removes
//! first-person possessives before sentence-length control. With an editor
//! model available, sentence splitting and grammar fixes are delegated to it.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::{debug, warn};

use super::numerals::spell_compact;
use super::rules::{CONJUNCTIONS, abbreviation_rules, abbreviations, can_end_sentence, possessive_rewrites};
use super::text::{capitalize_first, collapse_whitespace, split_sentences};
use super::types::FormatterConfig;
use crate::llm::{ChatModel, ChatRequest};

const SENTENCE_ENDERS: [char; 4] = ['.', '!', '?', '…'];

static ZERO_WIDTH: LazyLock<Regex> = LazyLock::new(|| Regex::new("[\u{200B}\u{200C}\u{200D}\u{FEFF}]").unwrap());
static CITATION_PAREN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\([A-ZÁČĎÉĚÍŇÓŘŠŤÚŮÝŽ][a-záčďéěíňóřšťúůýž]+,?\s+\d{4}\)").unwrap());
static CITATION_BRACKET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[[^\]]+\]").unwrap());
static CITATION_PODLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)podle\s+[A-ZÁČĎÉĚÍŇÓŘŠŤÚŮÝŽ][a-záčďéěíňóřšťúůýž]+a?").unwrap());
static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(1\d{3}|20\d{2})\b").unwrap());
static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+").unwrap());
static ELLIPSIS_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new("…{2,}").unwrap());
static SPACED_HYPHEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+-\s+").unwrap());
static PARAGRAPH_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\n+").unwrap());
static SPACE_BEFORE_PUNCT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+([.,!?;:])").unwrap());
static SPACE_AFTER_PUNCT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([.,!?;:])\s*").unwrap());
static REPEATED_TERMINATOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([.!?]){2,}").unwrap());

const EDITOR_SYSTEM: &str = "You are a conservative text editor who maintains objective third-person voice and never uses possessive pronouns.";

pub struct TextFormatter {
    cfg: FormatterConfig,
    warnings: Vec<String>,
}

impl TextFormatter {
    pub fn new(cfg: FormatterConfig) -> Self {
        Self { cfg, warnings: Vec::new() }
    }

    /// Warnings collected by the last `format*` call.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Offline formatting; never calls a model.
    pub fn format(&mut self, text: &str) -> String {
        self.warnings.clear();
        let prepared = self.prepare(text);
        let split = self.validate_and_split(&prepared);
        self.finish(&split)
    }

    /// Same pipeline, but the sentence/grammar step goes through `editor`
    /// when the config enables it. Editor failures fall back to the offline split.
    pub async fn format_with_editor(&mut self, text: &str, editor: &dyn ChatModel) -> String {
        self.warnings.clear();
        let prepared = self.prepare(text);
        let edited = if self.cfg.uses_editor() {
            match self.edit(&prepared, editor).await {
                Ok(out) if !out.trim().is_empty() => out,
                Ok(_) => prepared,
                Err(e) => {
                    warn!("editor pass failed, using offline sentence split: {}", e);
                    self.validate_and_split(&prepared)
                }
            }
        } else {
            self.validate_and_split(&prepared)
        };
        self.finish(&edited)
    }

    fn prepare(&self, text: &str) -> String {
        let t = normalize_whitespace(text);
        let t = remove_bracketed_citations(&t);
        let t = self.expand_abbreviations(&t);
        let t = self.convert_years(&t);
        let t = self.convert_numbers(&t);
        let t = self.normalize_ellipsis(&t);
        let t = self.normalize_dashes(&t);
        let t = ensure_sentence_termination(&t);
        self.remove_possessive_pronouns(&t)
    }

    fn finish(&self, text: &str) -> String {
        let out = final_cleanup(text);
        if !self.warnings.is_empty() {
            warn!("formatter warnings ({}): {}", self.cfg.language, self.warnings.join("; "));
        }
        out
    }

    pub fn expand_abbreviations(&self, text: &str) -> String {
        let mut t = text.to_string();
        for ((abbr, _), (re, full)) in abbreviations(self.cfg.language).iter().zip(abbreviation_rules(self.cfg.language)) {
            t = if can_end_sentence(abbr) {
                replace_keeping_terminator(&t, re, full)
            } else {
                re.replace_all(&t, *full).into_owned()
            };
        }
        // Sentence-initial forms of lower-case abbreviations.
        for (abbr, full) in abbreviations(self.cfg.language) {
            if abbr.starts_with(char::is_lowercase) {
                let cap = capitalize_first(abbr);
                if t.contains(cap.as_str()) {
                    let re = super::rules::abbreviation_regex(&cap);
                    t = re.replace_all(&t, capitalize_first(full).as_str()).into_owned();
                }
            }
        }
        t
    }

    pub fn convert_years(&self, text: &str) -> String {
        let lang = self.cfg.language;
        YEAR.replace_all(text, |c: &Captures| {
            c[0].parse::<u32>().ok().and_then(|y| spell_compact(y, lang)).unwrap_or_else(|| c[0].to_string())
        })
        .into_owned()
    }

    /// Standalone 1..=999 without a leading zero; longer digit runs stay.
    pub fn convert_numbers(&self, text: &str) -> String {
        let lang = self.cfg.language;
        DIGIT_RUN
            .replace_all(text, |c: &Captures| {
                let digits = &c[0];
                if digits.len() > 3 || digits.starts_with('0') {
                    return digits.to_string();
                }
                digits.parse::<u32>().ok().and_then(|n| spell_compact(n, lang)).unwrap_or_else(|| digits.to_string())
            })
            .into_owned()
    }

    fn normalize_ellipsis(&self, text: &str) -> String {
        let t = if self.cfg.use_single_ellipsis_char { text.replace("...", "…") } else { text.to_string() };
        ELLIPSIS_RUN.replace_all(&t, "…").into_owned()
    }

    fn normalize_dashes(&self, text: &str) -> String {
        if self.cfg.use_en_dash_for_aside {
            SPACED_HYPHEN.replace_all(text, " – ").into_owned()
        } else {
            text.to_string()
        }
    }

    pub fn remove_possessive_pronouns(&self, text: &str) -> String {
        let mut t = text.to_string();
        for (re, repl) in possessive_rewrites(self.cfg.language) {
            t = re.replace_all(&t, *repl).into_owned();
        }
        collapse_whitespace(&t)
    }

    fn validate_and_split(&mut self, text: &str) -> String {
        let max = self.cfg.max_sentence_words;
        let min = self.cfg.min_sentence_words;
        if text.trim().is_empty() {
            self.warnings.push(format!("sentence_1_too_short_0_words_minimum_{min}"));
            return String::new();
        }
        let mut out: Vec<String> = Vec::new();
        for (i, sentence) in split_sentences(text, &SENTENCE_ENDERS).into_iter().enumerate() {
            let idx = i + 1;
            let words: Vec<&str> = sentence.split_whitespace().collect();
            let n = words.len();
            if n < min {
                self.warnings.push(format!("sentence_{idx}_too_short_{n}_words_minimum_{min}"));
            } else if n > max {
                if self.cfg.strict_sentence_split {
                    out.extend(intelligent_split(&words, max));
                    continue;
                }
                self.warnings.push(format!("sentence_{idx}_exceeds_{n}_words_maximum_{max}"));
            }
            out.push(sentence.to_string());
        }
        out.join(" ")
    }

    async fn edit(&self, text: &str, editor: &dyn ChatModel) -> Result<String, crate::llm::LlmError> {
        let prompt = format!(
            "You are a professional {} text editor for documentary narration.\n\
             Rules:\n\
             1) Split only sentences longer than 40 words into 2 shorter sentences; keep meaning.\n\
             2) Fix only obvious grammar/spelling/punctuation errors conservatively.\n\
             3) Keep documentary, neutral, objective third-person tone.\n\
             4) Do not add or remove factual content.\n\
             5) NEVER use possessive pronouns like 'our', 'my' (Czech: 'náš', 'naše', 'našeho').\n\
             6) Use objective third-person voice throughout.\n\
             Return ONLY the processed text.\n\nTEXT:\n{}",
            self.cfg.language.english_name(),
            text
        );
        let req = ChatRequest::new(&self.cfg.model)
            .system(EDITOR_SYSTEM)
            .user(prompt)
            .temperature(self.cfg.temperature_split.min(self.cfg.temperature_grammar))
            .max_tokens(16_000);
        let resp = editor.chat(&req).await?;
        debug!("editor returned {} chars", resp.text.len());
        Ok(resp.text.trim().to_string())
    }
}

/// Expands `re` matches, keeping the abbreviation's `.` when it closes the
/// sentence: end of text, or whitespace then an upper-case letter.
fn replace_keeping_terminator(text: &str, re: &Regex, full: &str) -> String {
    re.replace_all(text, |c: &Captures| {
        let Some(m) = c.get(0) else {
            return full.to_string();
        };
        let rest = &text[m.end()..];
        let closes = rest.trim().is_empty()
            || (rest.starts_with(char::is_whitespace) && rest.trim_start().starts_with(char::is_uppercase));
        if closes { format!("{full}.") } else { full.to_string() }
    })
    .into_owned()
}

pub fn normalize_whitespace(text: &str) -> String {
    let t = text.replace("\r\n", "\n").replace('\r', "\n");
    let t = ZERO_WIDTH.replace_all(&t, "");
    collapse_whitespace(&t)
}

pub fn remove_bracketed_citations(text: &str) -> String {
    let t = CITATION_PAREN.replace_all(text, "");
    let t = CITATION_BRACKET.replace_all(&t, "");
    CITATION_PODLE.replace_all(&t, "").into_owned()
}

fn fix_punctuation_spacing(text: &str) -> String {
    let t = SPACE_BEFORE_PUNCT.replace_all(text, "$1");
    SPACE_AFTER_PUNCT.replace_all(&t, "$1 ").into_owned()
}

pub fn ensure_sentence_termination(text: &str) -> String {
    let paragraphs: Vec<String> = PARAGRAPH_BREAK
        .split(text.trim())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            if p.ends_with(SENTENCE_ENDERS) { p.to_string() } else { format!("{p}.") }
        })
        .collect();
    fix_punctuation_spacing(&paragraphs.join("\n\n"))
}

/// Splits an over-long sentence near its middle, preferring a comma, then a
/// conjunction, then the exact midpoint.
pub fn intelligent_split(words: &[&str], max_words: usize) -> Vec<String> {
    let n = words.len();
    if n <= max_words {
        return vec![words.join(" ")];
    }
    let mid = n / 2;
    let lo = (mid as isize - 10).max(10) as usize;
    let hi = (n as isize - 10).min(mid as isize + 10).max(0) as usize;
    let window = lo..hi.max(lo);

    let halves = |cut: usize| -> Vec<String> {
        let first = words[..cut].join(" ");
        let first = first.trim_end_matches([',', ' ']);
        vec![format!("{first}."), capitalize_first(&words[cut..].join(" "))]
    };

    if let Some(i) = window.clone().find(|&i| words[i].contains(',')) {
        return halves(i + 1);
    }
    if let Some(i) = window.clone().find(|&i| CONJUNCTIONS.contains(&words[i].trim_matches(',').to_lowercase().as_str())) {
        return halves(i);
    }
    halves(mid)
}

pub fn final_cleanup(text: &str) -> String {
    let t = REPEATED_TERMINATOR.replace_all(text, "$1");
    let t = fix_punctuation_spacing(&t);
    collapse_whitespace(&t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::Language;
    use crate::llm::LlmError;
    use crate::llm::testing::ScriptedModel;

    fn offline(lang: Language) -> TextFormatter {
        TextFormatter::new(FormatterConfig::offline(lang))
    }

    #[test]
    fn czech_years_numbers_and_punctuation() {
        let mut f = offline(Language::Cs);
        let src = "Podle Nováka [zdroj] v roce 1914 nastaly změny... 25 vojáků šlo dál - a pak nic. \
                   Např. 12 lidí , tj. 3 jednotky";
        let out = f.format(src);
        assert!(out.contains('…'));
        assert!(!out.contains("1914"));
        assert!(out.contains("tisícdevětsetčtrnáct"));
        assert!(out.contains("dvacetpět"));
        assert!(out.contains("Například dvanáct lidí, to jest tři jednotky."));
        assert!(out.contains(" – a pak nic"));
        assert!(!out.contains("[zdroj]"));
        assert!(!out.contains("Nováka"));
        assert!(!out.contains(" ,"));
        assert!(!out.contains(" ."));
    }

    #[test]
    fn numbers_with_leading_zero_or_four_digits_are_kept() {
        let f = offline(Language::En);
        assert_eq!(f.convert_numbers("007 and 5000 and 42"), "007 and 5000 and fortytwo");
        assert_eq!(f.convert_years("in 1066 and 2150"), "in onethousandandsixtysix and 2150");
    }

    #[test]
    fn abbreviation_before_space_expands() {
        let f = offline(Language::En);
        assert_eq!(f.expand_abbreviations("tools, e.g. hammers"), "tools, for example hammers");
        let f = offline(Language::Cs);
        assert_eq!(f.expand_abbreviations("cca deset"), "cirka deset");
    }

    #[test]
    fn sentence_final_abbreviation_keeps_terminator() {
        let mut f = offline(Language::En);
        let out = f.format("He bought hammers, nails, etc. Then he walked home.");
        assert_eq!(out, "He bought hammers, nails, et cetera. Then he walked home.");
        assert_eq!(f.expand_abbreviations("nails, etc. and glue"), "nails, et cetera and glue");
        assert_eq!(f.expand_abbreviations("tools etc."), "tools et cetera.");
        assert_eq!(f.expand_abbreviations("Dr. Watson"), "Doctor Watson");

        let mut f = offline(Language::Cs);
        let out = f.format("Koupil kladiva, hřebíky atd. Potom šel domů.");
        assert_eq!(out, "Koupil kladiva, hřebíky a tak dále. Potom šel domů.");
        assert_eq!(f.warnings().len(), 2);
    }

    #[test]
    fn possessives_are_rewritten() {
        let f = offline(Language::En);
        assert_eq!(f.remove_possessive_pronouns("In our series we cover it"), "In the series we cover it");
        let f = offline(Language::Cs);
        assert_eq!(f.remove_possessive_pronouns("Díl v našem seriálu a našich dějin."), "Díl v tomto seriálu a dějin.");
        let f = offline(Language::Fr);
        assert_eq!(f.remove_possessive_pronouns("dans notre épisode"), "dans l'épisode");
    }

    #[test]
    fn soft_mode_warns_about_sentence_lengths() {
        let mut f = offline(Language::Cs);
        let long = vec!["slovo"; 35].join(" ") + ".";
        let out = f.format(&format!("Krátká věta. {long}"));
        assert!(out.starts_with("Krátká věta."));
        assert_eq!(f.warnings()[0], "sentence_1_too_short_2_words_minimum_20");
        assert_eq!(f.warnings()[1], "sentence_2_exceeds_35_words_maximum_30");
    }

    #[test]
    fn empty_text_is_flagged() {
        let mut f = offline(Language::Cs);
        assert_eq!(f.format("  \n "), "");
        assert_eq!(f.warnings(), ["sentence_1_too_short_0_words_minimum_20"]);
    }

    #[test]
    fn strict_mode_splits_long_sentences() {
        let mut cfg = FormatterConfig::offline(Language::Cs);
        cfg.strict_sentence_split = true;
        let mut f = TextFormatter::new(cfg);
        let out = f.format(&(vec!["slovo"; 65].join(" ") + "."));
        assert!(out.matches('.').count() >= 2);
        assert!(out.contains(". Slovo"));
    }

    #[test]
    fn split_prefers_comma_then_conjunction() {
        let mut words = vec!["w"; 40];
        words[22] = "w,";
        let parts = intelligent_split(&words, 30);
        assert_eq!(parts[0].split_whitespace().count(), 23);
        assert!(parts[0].ends_with("w."));

        let mut words = vec!["w"; 40];
        words[15] = "and";
        let parts = intelligent_split(&words, 30);
        assert!(parts[1].starts_with("And "));
        assert_eq!(parts[0].split_whitespace().count(), 15);

        let parts = intelligent_split(&vec!["w"; 40], 30);
        assert_eq!(parts[0].split_whitespace().count(), 20);
    }

    #[test]
    fn final_cleanup_collapses_terminators() {
        assert_eq!(final_cleanup("Konec!!  Další ..věta"), "Konec! Další. věta");
    }

    #[tokio::test]
    async fn editor_reply_is_used() {
        let model = ScriptedModel::new(["Upravený text."]);
        let mut f = TextFormatter::new(FormatterConfig::new(Language::Cs));
        let out = f.format_with_editor("Původní text", &model).await;
        assert_eq!(out, "Upravený text.");
        assert!(model.prompt(0).contains("TEXT:\nPůvodní text."));
        let req = model.seen.lock().unwrap()[0].clone();
        assert_eq!(req.temperature, Some(0.2));
    }

    #[tokio::test]
    async fn editor_failure_falls_back_to_offline_split() {
        let model = ScriptedModel::failing();
        model.push_err(LlmError::Timeout);
        let mut f = TextFormatter::new(FormatterConfig::new(Language::En));
        let out = f.format_with_editor("our series began in 1918", &model).await;
        assert_eq!(out, "the series began in onethousandninehundredandeighteen.");
        assert!(!f.warnings().is_empty());
    }
}
