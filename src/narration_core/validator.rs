use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::rules::{meta_phrases, possessive_patterns};
use super::text::split_sentences;
use crate::lang::Language;

static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(1\d{3}|20\d{2})\b").unwrap());
static CAPITALIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-ZÁČĎÉĚÍŇÓŘŠŤÚŮÝŽ][a-záčďéěíňóřšťúůýž]+\b").unwrap());
static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-zÀ-ÖØ-öø-ÿĀ-žḀ-ỿ0-9]+").unwrap());

const TRANSITION_ENDERS: [char; 3] = ['.', '!', '?'];
const SEGMENT_ENDERS: [char; 4] = ['.', '!', '?', '…'];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub reasons: Vec<String>,
}

impl ValidationResult {
    fn from_reasons(reasons: Vec<String>) -> Self {
        Self { ok: reasons.is_empty(), reasons }
    }
}

fn contains_meta_phrase(lang: Language, lowered: &str) -> bool {
    meta_phrases(lang).iter().any(|p| lowered.contains(&p.to_lowercase()))
}

fn anchors(text: &str) -> HashSet<String> {
    YEAR.find_iter(text).chain(CAPITALIZED.find_iter(text)).map(|m| m.as_str().to_string()).collect()
}

fn tokens(lowered: &str) -> HashSet<&str> {
    TOKEN.find_iter(lowered).map(|m| m.as_str()).collect()
}

fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.union(b).count();
    inter as f64 / union.max(1) as f64
}

/// Checks that a generated transition is short, non-meta, anchored in the
/// surrounding text and not a copy of it.
pub struct TransitionQualityValidator {
    lang: Language,
}

impl TransitionQualityValidator {
    pub fn new(lang: Language) -> Self {
        Self { lang }
    }

    pub fn validate(&self, prev: &str, next: &str, transition: &str) -> ValidationResult {
        let mut reasons = Vec::new();

        let sentences = split_sentences(transition, &TRANSITION_ENDERS);
        if sentences.is_empty() {
            reasons.push("empty_transition".to_string());
        }
        if sentences.len() > 2 {
            reasons.push("too_many_sentences".to_string());
        }

        let low = transition.trim().to_lowercase();
        if contains_meta_phrase(self.lang, &low) {
            reasons.push("contains_meta_phrase".to_string());
        }

        let mut all = anchors(prev);
        all.extend(anchors(next));
        if !all.is_empty() && !all.iter().any(|a| low.contains(&a.to_lowercase())) {
            reasons.push("missing_anchor".to_string());
        }

        let own = tokens(&low);
        if !own.is_empty() {
            for ctx in [prev, next] {
                let ctx_low = ctx.to_lowercase();
                if jaccard(&own, &tokens(&ctx_low)) > 0.5 {
                    reasons.push("too_similar_to_context".to_string());
                    break;
                }
            }
        }

        ValidationResult::from_reasons(reasons)
    }
}

const MAX_SEGMENT_SENTENCE_WORDS: usize = 40;

/// Checks a narration segment for leftover possessives, meta phrases and
/// run-on sentences.
pub struct SegmentQualityValidator {
    lang: Language,
}

impl SegmentQualityValidator {
    pub fn new(lang: Language) -> Self {
        Self { lang }
    }

    pub fn validate(&self, text: &str) -> ValidationResult {
        if text.trim().is_empty() {
            return ValidationResult::from_reasons(vec!["empty_segment".to_string()]);
        }
        let mut reasons = Vec::new();
        if possessive_patterns(self.lang).iter().any(|re| re.is_match(text)) {
            reasons.push("contains_possessive".to_string());
        }
        if contains_meta_phrase(self.lang, &text.to_lowercase()) {
            reasons.push("contains_meta_phrase".to_string());
        }
        for (i, sentence) in split_sentences(text, &SEGMENT_ENDERS).into_iter().enumerate() {
            let n = sentence.split_whitespace().count();
            if n > MAX_SEGMENT_SENTENCE_WORDS {
                reasons.push(format!("sentence_{}_too_long_{}_words", i + 1, n));
            }
        }
        ValidationResult::from_reasons(reasons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn good_transition_passes() {
        let v = TransitionQualityValidator::new(Language::Cs);
        let prev = "V roce 1918 vznikla republika a Masaryk se vrátil do Prahy.";
        let next = "Nový stát musel řešit hranice se sousedy.";
        let r = v.validate(prev, next, "Po roce 1918 se pozornost obrátila k otázce hranic nového státu.");
        assert!(r.ok, "{:?}", r.reasons);
    }

    #[test]
    fn meta_and_sentence_count_are_flagged() {
        let v = TransitionQualityValidator::new(Language::En);
        let r = v.validate("", "", "In this episode it goes. Then more. And more. Again.");
        assert!(!r.ok);
        assert!(r.reasons.contains(&"too_many_sentences".to_string()));
        assert!(r.reasons.contains(&"contains_meta_phrase".to_string()));
        assert_eq!(v.validate("", "", "  ").reasons, vec!["empty_transition"]);
    }

    #[test]
    fn missing_anchor_and_copy_detection() {
        let v = TransitionQualityValidator::new(Language::En);
        let prev = "the treaty of Versailles was signed in 1919";
        let r = v.validate(prev, "later events followed", "things then moved along quickly.");
        assert_eq!(r.reasons, vec!["missing_anchor"]);

        let r = v.validate(prev, "later", "The treaty of Versailles was signed in 1919.");
        assert_eq!(r.reasons, vec!["too_similar_to_context"]);
    }

    #[test]
    fn segment_checks() {
        let v = SegmentQualityValidator::new(Language::Cs);
        assert_eq!(v.validate("").reasons, vec!["empty_segment"]);
        let r = v.validate("První díl našeho seriálu.");
        assert_eq!(r.reasons, vec!["contains_possessive"]);
        assert!(v.validate("V této epizodě se stalo mnoho věcí.").reasons.contains(&"contains_meta_phrase".to_string()));

        let long = vec!["slovo"; 42].join(" ") + ". Krátká věta.";
        assert_eq!(v.validate(&long).reasons, vec!["sentence_1_too_long_42_words"]);
    }
}
