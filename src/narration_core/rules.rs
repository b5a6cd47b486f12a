//! Per-language rule tables used by the formatter and the validators.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::lang::Language;

pub fn abbreviations(lang: Language) -> &'static [(&'static str, &'static str)] {
    match lang {
        Language::Cs => &[
            ("např.", "například"),
            ("tzv.", "takzvaný"),
            ("tj.", "to jest"),
            ("tzn.", "to znamená"),
            ("atd.", "a tak dále"),
            ("apod.", "a podobně"),
            ("resp.", "respektive"),
            ("popř.", "popřípadě"),
            ("cca", "cirka"),
            ("č.", "číslo"),
            ("str.", "strana"),
            ("odd.", "oddíl"),
            ("ods.", "odstavec"),
            ("kpt.", "kapitán"),
            ("plk.", "plukovník"),
            ("gen.", "generál"),
            ("dr.", "doktor"),
            ("prof.", "profesor"),
            ("ing.", "inženýr"),
        ],
        Language::En => &[
            ("e.g.", "for example"),
            ("i.e.", "that is"),
            ("etc.", "et cetera"),
            ("vs.", "versus"),
            ("ca.", "circa"),
            ("approx.", "approximately"),
            ("Dr.", "Doctor"),
            ("Prof.", "Professor"),
        ],
        Language::De => &[
            ("z.B.", "zum Beispiel"),
            ("d.h.", "das heißt"),
            ("usw.", "und so weiter"),
            ("bzw.", "beziehungsweise"),
            ("ca.", "circa"),
            ("Dr.", "Doktor"),
            ("Prof.", "Professor"),
        ],
        Language::Es => &[
            ("p.ej.", "por ejemplo"),
            ("etc.", "etcétera"),
            ("aprox.", "aproximadamente"),
            ("Dr.", "Doctor"),
            ("Prof.", "Profesor"),
        ],
        Language::Fr => &[
            ("p.ex.", "par exemple"),
            ("c.-à-d.", "c'est-à-dire"),
            ("etc.", "et cetera"),
            ("env.", "environ"),
            ("Dr.", "Docteur"),
            ("Prof.", "Professeur"),
        ],
    }
}

/// Abbreviations that may close a sentence. Titles and lead-ins such as
/// `Dr.` or `např.` always precede another word and never do.
const SENTENCE_FINAL: &[&str] = &["atd.", "apod.", "etc.", "usw."];

pub fn can_end_sentence(abbr: &str) -> bool {
    SENTENCE_FINAL.contains(&abbr)
}

/// Compiled abbreviation matcher. A trailing word boundary is only required
/// when the abbreviation itself ends in a word character.
pub fn abbreviation_regex(abbr: &str) -> Regex {
    let tail = if abbr.chars().last().is_some_and(char::is_alphanumeric) { r"\b" } else { "" };
    Regex::new(&format!(r"\b{}{}", regex::escape(abbr), tail)).unwrap()
}

static ABBREVIATION_RULES: LazyLock<HashMap<Language, Vec<(Regex, &'static str)>>> = LazyLock::new(|| {
    Language::ALL
        .iter()
        .map(|&lang| {
            let rules = abbreviations(lang).iter().map(|(abbr, full)| (abbreviation_regex(abbr), *full)).collect();
            (lang, rules)
        })
        .collect()
});

pub fn abbreviation_rules(lang: Language) -> &'static [(Regex, &'static str)] {
    ABBREVIATION_RULES.get(&lang).map(Vec::as_slice).unwrap_or(&[])
}

fn compile(rules: &[(&str, &'static str)]) -> Vec<(Regex, &'static str)> {
    rules.iter().map(|(p, r)| (Regex::new(&format!("(?i){p}")).unwrap(), *r)).collect()
}

static POSSESSIVE_REWRITES: LazyLock<HashMap<Language, Vec<(Regex, &'static str)>>> = LazyLock::new(|| {
    let mut m = HashMap::new();
    // Context-specific rewrites come before the catch-all removals.
    m.insert(
        Language::Cs,
        compile(&[
            (r"\bv\s+našem\s+dokumentu\b", "v tomto dokumentu"),
            (r"\bv\s+naší\s+sérii\b", "v této sérii"),
            (r"\bv\s+našem\s+seriálu\b", "v tomto seriálu"),
            (r"\bdokumentárního\s+seriálu\s+našeho\b", "dokumentárního seriálu"),
            (r"\bsérií\s+našich\b", "těmto sériím"),
            (r"\bnáš(eho|emu|ím|em|e|i|ich|imi)?\b", ""),
            (r"\bnaš(eho|emu|ím|im|imi|em|e|í|i|ích|ich)?\b", ""),
        ]),
    );
    m.insert(
        Language::En,
        compile(&[
            (r"\bour\s+series\b", "the series"),
            (r"\bour\s+documentary\b", "the documentary"),
            (r"\bour\s+episode\b", "the episode"),
            (r"\bin\s+our\s+", "in the "),
            (r"\bof\s+our\s+", "of the "),
            (r"\bour\s+", "the "),
            (r"\bmy\s+", "the "),
            (r"\bours\b", ""),
        ]),
    );
    m.insert(
        Language::De,
        compile(&[
            (r"\bunserer\s+Serie\b", "der Serie"),
            (r"\bunserem\s+Dokumentarfilm\b", "dem Dokumentarfilm"),
            (r"\bunsere\s+Episode\b", "die Episode"),
            (r"\bunser(er|em|e|es|en)?\s+", "der "),
        ]),
    );
    m.insert(
        Language::Es,
        compile(&[
            (r"\bnuestra\s+serie\b", "la serie"),
            (r"\bnuestro\s+documental\b", "el documental"),
            (r"\bnuestro\s+episodio\b", "el episodio"),
            (r"\bnuestro(s)?\s+", "el "),
            (r"\bnuestra(s)?\s+", "la "),
        ]),
    );
    m.insert(
        Language::Fr,
        compile(&[
            (r"\bnotre\s+série\b", "la série"),
            (r"\bnotre\s+documentaire\b", "le documentaire"),
            (r"\bnotre\s+épisode\b", "l'épisode"),
            (r"\bnotre\s+", "le "),
            (r"\bnos\s+", "les "),
        ]),
    );
    m
});

pub fn possessive_rewrites(lang: Language) -> &'static [(Regex, &'static str)] {
    POSSESSIVE_REWRITES.get(&lang).map(Vec::as_slice).unwrap_or(&[])
}

/// Detection-only patterns: any match means a first-person possessive survived.
static POSSESSIVE_PATTERNS: LazyLock<HashMap<Language, Vec<Regex>>> = LazyLock::new(|| {
    let table: [(Language, &[&str]); 5] = [
        (Language::Cs, &[r"\bnáš\w*", r"\bnaš\w*"]),
        (Language::En, &[r"\bour\b", r"\bours\b", r"\bmy\b"]),
        (Language::De, &[r"\bunser\w*"]),
        (Language::Es, &[r"\bnuestr[oa]s?\b"]),
        (Language::Fr, &[r"\bnotre\b", r"\bnos\b"]),
    ];
    table
        .into_iter()
        .map(|(lang, pats)| (lang, pats.iter().map(|p| Regex::new(&format!("(?i){p}")).unwrap()).collect()))
        .collect()
});

pub fn possessive_patterns(lang: Language) -> &'static [Regex] {
    POSSESSIVE_PATTERNS.get(&lang).map(Vec::as_slice).unwrap_or(&[])
}

pub fn meta_phrases(lang: Language) -> &'static [&'static str] {
    match lang {
        Language::Cs => &[
            "v této části",
            "v této kapitole",
            "v následující části",
            "nyní se podíváme",
            "tato sekce",
            "v této epizodě",
            "v následující epizodě",
            "v příští části",
        ],
        Language::En => &[
            "in this section",
            "in the following section",
            "now we will look",
            "this section",
            "in this episode",
            "in the next episode",
        ],
        Language::De => &[
            "in diesem abschnitt",
            "im folgenden abschnitt",
            "nun betrachten wir",
            "diese sektion",
            "in dieser episode",
            "in der nächsten episode",
        ],
        Language::Es => &[
            "en esta sección",
            "en la siguiente sección",
            "ahora veremos",
            "esta sección",
            "en este episodio",
            "en el próximo episodio",
        ],
        Language::Fr => &[
            "dans cette section",
            "dans la section suivante",
            "nous allons maintenant",
            "cette section",
            "dans cet épisode",
            "dans le prochain épisode",
        ],
    }
}

/// Split points for over-long sentences, across all supported languages.
pub const CONJUNCTIONS: &[&str] = &[
    "a", "ale", "však", "zatímco", "protože", "nebo", "and", "but", "while", "because", "or", "und", "aber",
    "während", "weil", "oder", "y", "pero", "mientras", "porque", "o", "et", "mais", "tandis", "parce", "ou",
];
