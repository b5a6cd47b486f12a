use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Language {
    Cs,
    En,
    De,
    Es,
    Fr,
}

impl Language {
    pub const ALL: [Language; 5] = [Language::Cs, Language::En, Language::De, Language::Es, Language::Fr];

    pub fn code(self) -> &'static str {
        match self {
            Language::Cs => "CS",
            Language::En => "EN",
            Language::De => "DE",
            Language::Es => "ES",
            Language::Fr => "FR",
        }
    }

    pub fn lower(self) -> String {
        self.code().to_ascii_lowercase()
    }

    pub fn english_name(self) -> &'static str {
        match self {
            Language::Cs => "Czech",
            Language::En => "English",
            Language::De => "German",
            Language::Es => "Spanish",
            Language::Fr => "French",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CS" => Ok(Language::Cs),
            "EN" => Ok(Language::En),
            "DE" => Ok(Language::De),
            "ES" => Ok(Language::Es),
            "FR" => Ok(Language::Fr),
            other => Err(format!("unsupported language code: {other:?}")),
        }
    }
}

impl TryFrom<String> for Language {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Language> for String {
    fn from(value: Language) -> Self {
        value.code().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_any_case() {
        assert_eq!("cs".parse::<Language>().unwrap(), Language::Cs);
        assert_eq!(" Fr ".parse::<Language>().unwrap(), Language::Fr);
        assert!("pl".parse::<Language>().is_err());
    }

    #[test]
    fn serializes_as_upper_code() {
        let json = serde_json::to_string(&Language::De).unwrap();
        assert_eq!(json, "\"DE\"");
        let back: Language = serde_json::from_str("\"es\"").unwrap();
        assert_eq!(back, Language::Es);
    }
}
