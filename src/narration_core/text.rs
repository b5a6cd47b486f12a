use regex::Regex;
use std::sync::LazyLock;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

/// Splits after any of `enders` when followed by whitespace. Empty pieces are dropped.
pub fn split_sentences<'a>(text: &'a str, enders: &[char]) -> Vec<&'a str> {
    let text = text.trim();
    let mut out = Vec::new();
    let mut start = 0;
    let mut prev: Option<char> = None;
    let mut iter = text.char_indices().peekable();
    while let Some((i, c)) = iter.next() {
        if c.is_whitespace() && prev.is_some_and(|p| enders.contains(&p)) {
            let piece = &text[start..i];
            if !piece.is_empty() {
                out.push(piece);
            }
            while let Some(&(_, n)) = iter.peek() {
                if n.is_whitespace() {
                    iter.next();
                } else {
                    break;
                }
            }
            start = iter.peek().map(|&(j, _)| j).unwrap_or(text.len());
            prev = None;
            continue;
        }
        prev = Some(c);
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

pub fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// First `n` chars (not bytes).
pub fn prefix_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminator_followed_by_space() {
        let parts = split_sentences("Prvni veta. Druha?  Treti… ctvrta", &['.', '!', '?', '…']);
        assert_eq!(parts, vec!["Prvni veta.", "Druha?", "Treti…", "ctvrta"]);
    }

    #[test]
    fn does_not_split_inside_tokens() {
        assert_eq!(split_sentences("v.1.2 je verze.", &['.']), vec!["v.1.2 je verze."]);
        assert!(split_sentences("   ", &['.']).is_empty());
    }

    #[test]
    fn helpers() {
        assert_eq!(capitalize_first("ďábel"), "Ďábel");
        assert_eq!(collapse_whitespace(" a \n\t b "), "a b");
        assert_eq!(prefix_chars("žluťoučký", 3), "žlu");
        assert_eq!(prefix_chars("ab", 5), "ab");
    }
}
