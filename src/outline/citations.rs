//! Matching of per-MSP source references against an episode's `sources_used`.
//!
//! A reference matches an available source when their bases agree after NFKC,
//! whitespace and case normalization, with or without parenthetical parts.
//! Page ranges (`p.`/`pp.` tails) must fall inside an available interval.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use unicode_normalization::UnicodeNormalization;

pub type PageRange = (u32, u32);

static PAGES_TAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[,;\s]*(?:pp?\.?)\s*(\d+\s*[-–—]\s*\d+(?:\s*,\s*\d+\s*[-–—]\s*\d+)*)\s*$").unwrap()
});
static RANGE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s*[-–—]\s*(\d+)").unwrap());
static PARENS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\([^)]*\)").unwrap());
static WS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

fn nfkc(s: &str) -> String {
    s.nfkc().collect::<String>().replace('\u{00A0}', " ").trim().to_string()
}

fn trim_separators(s: &str) -> &str {
    s.trim_matches(|c| c == ',' || c == ';' || c == ' ')
}

pub fn canon_key(s: &str) -> String {
    let s = nfkc(s);
    trim_separators(&WS.replace_all(&s, " ")).to_lowercase()
}

fn strip_parens(s: &str) -> String {
    PARENS.replace_all(s, " ").into_owned()
}

/// Keys a reference may match under: the full base, then the base without
/// parenthetical parts when that differs.
fn canon_keys(s: &str) -> Vec<String> {
    let full = canon_key(s);
    let stripped = canon_key(&strip_parens(s));
    if stripped == full { vec![full] } else { vec![full, stripped] }
}

/// Splits `"Author, Title, pp. 10–20, 30–40"` into the base and its ranges.
/// Ranges are normalized so that `lo <= hi`.
pub fn split_base_and_pages(s: &str) -> (String, Option<Vec<PageRange>>) {
    let s = nfkc(s);
    let Some(caps) = PAGES_TAIL.captures(&s) else {
        return (s.trim_end_matches([',', ';', ' ']).to_string(), None);
    };
    let ranges: Vec<PageRange> = RANGE
        .captures_iter(&caps[1])
        .filter_map(|c| {
            let a: u32 = c[1].parse().ok()?;
            let b: u32 = c[2].parse().ok()?;
            Some(if a > b { (b, a) } else { (a, b) })
        })
        .collect();
    if ranges.is_empty() {
        return (s.trim_end_matches([',', ';', ' ']).to_string(), None);
    }
    let base = PAGES_TAIL.replace(&s, "");
    (base.trim_end_matches([',', ';', ' ']).to_string(), Some(ranges))
}

#[derive(Debug, Clone)]
pub struct AvailableSource {
    /// Base string as written in `sources_used`, without pages.
    pub base: String,
    pub pages: Option<Vec<PageRange>>,
}

/// Index of available sources. Entries sharing a base merge their intervals.
#[derive(Debug, Default)]
pub struct SourceIndex {
    entries: Vec<AvailableSource>,
    keys: HashMap<String, usize>,
}

impl SourceIndex {
    pub fn build(available: &[String]) -> Self {
        let mut idx = SourceIndex::default();
        let mut by_base: HashMap<String, usize> = HashMap::new();
        for src in available {
            let (base, pages) = split_base_and_pages(src);
            let key_full = canon_key(&base);
            let key_stripped = canon_key(&strip_parens(&base));
            let slot = match by_base.get(&key_full) {
                Some(&i) => {
                    if let Some(more) = pages {
                        match &mut idx.entries[i].pages {
                            Some(existing) => existing.extend(more),
                            slot => *slot = Some(more),
                        }
                    }
                    i
                }
                None => {
                    idx.entries.push(AvailableSource { base: base.clone(), pages });
                    let i = idx.entries.len() - 1;
                    by_base.insert(key_full.clone(), i);
                    i
                }
            };
            idx.keys.insert(key_full, slot);
            idx.keys.insert(key_stripped, slot);
        }
        idx
    }

    pub fn lookup(&self, reference_base: &str) -> Option<&AvailableSource> {
        canon_keys(reference_base).iter().find_map(|k| self.keys.get(k)).map(|&i| &self.entries[i])
    }
}

fn format_pages(base: &str, (lo, hi): PageRange) -> String {
    format!("{base}, pp. {lo}\u{2013}{hi}")
}

/// Rewrites references to the exact strings of `available`.
///
/// Page ranges are clamped into the first intersecting interval, or replaced
/// by the first interval when none intersects. Unknown references are kept.
pub fn canonicalize_msp_sources(refs: &[String], available: &[String]) -> Vec<String> {
    let idx = SourceIndex::build(available);
    refs.iter()
        .map(|reference| {
            let (ref_base, ref_pages) = split_base_and_pages(reference);
            let Some(entry) = idx.lookup(&ref_base) else {
                return reference.clone();
            };
            match (&entry.pages, ref_pages.as_deref().and_then(|p| p.first())) {
                (Some(av), Some(&(a, b))) => {
                    let chosen = av
                        .iter()
                        .find_map(|&(lo, hi)| {
                            if b < lo || a > hi {
                                return None;
                            }
                            let (a2, b2) = (a.max(lo), b.min(hi));
                            (a2 <= b2).then_some((a2, b2))
                        })
                        .unwrap_or(av[0]);
                    format_pages(&entry.base, chosen)
                }
                (Some(av), None) => format_pages(&entry.base, av[0]),
                (None, _) => entry.base.clone(),
            }
        })
        .collect()
}

/// In-place canonicalization over a raw outline reply, run before it is
/// deserialized so that validation sees the rewritten strings.
pub fn canonicalize_parsed_citations(parsed: &mut serde_json::Value) {
    let Some(episodes) = parsed.get_mut("episodes").and_then(|e| e.as_array_mut()) else {
        return;
    };
    for ep in episodes.iter_mut().filter_map(|e| e.as_object_mut()) {
        let available: Vec<String> = match ep.get("sources_used").and_then(|s| s.as_array()) {
            Some(items) if !items.is_empty() => {
                items.iter().filter_map(|s| s.as_str().map(str::to_string)).collect()
            }
            _ => continue,
        };
        let Some(msps) = ep.get_mut("msp").and_then(|m| m.as_array_mut()) else {
            continue;
        };
        for msp in msps.iter_mut().filter_map(|m| m.as_object_mut()) {
            let refs: Vec<String> = match msp.get("sources_segment").and_then(|s| s.as_array()) {
                Some(items) if !items.is_empty() => {
                    items.iter().filter_map(|s| s.as_str().map(str::to_string)).collect()
                }
                _ => continue,
            };
            let fixed = canonicalize_msp_sources(&refs, &available);
            msp.insert("sources_segment".to_string(), serde_json::json!(fixed));
        }
    }
}

/// Checks one MSP's references. Returns a message for the first violation.
pub fn check_references(msp_number: usize, refs: &[String], idx: &SourceIndex, available: &[String]) -> Result<(), String> {
    if refs.is_empty() {
        return Err(format!("MSP {msp_number} must have at least one source"));
    }
    let listing = available.join(", ");
    for reference in refs {
        let (base, pages) = split_base_and_pages(reference);
        let Some(entry) = idx.lookup(&base) else {
            return Err(format!(
                "MSP {msp_number} references unknown source: {reference}. Available sources: {listing}"
            ));
        };
        match (&entry.pages, pages) {
            (None, Some(_)) => {
                return Err(format!(
                    "MSP {msp_number} must not specify pages for source without pages: {reference}. Available sources: {listing}"
                ));
            }
            (Some(_), None) => {
                return Err(format!(
                    "MSP {msp_number} must specify page subrange for source with pages: {reference}. Available sources: {listing}"
                ));
            }
            (Some(av), Some(cited)) => {
                for (a, b) in cited {
                    if !av.iter().any(|&(lo, hi)| lo <= a && b <= hi) {
                        let ranges: Vec<String> = av.iter().map(|(lo, hi)| format!("{lo}\u{2013}{hi}")).collect();
                        return Err(format!(
                            "MSP {msp_number} page range {a}\u{2013}{b} outside available ranges {} for source: {reference}",
                            ranges.join("; ")
                        ));
                    }
                }
            }
            (None, None) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn splits_multi_range_tails() {
        let (base, pages) = split_base_and_pages("Klimek, Boj o Hrad, pp. 102–104, 110-111");
        assert_eq!(base, "Klimek, Boj o Hrad");
        assert_eq!(pages, Some(vec![(102, 104), (110, 111)]));

        let (base, pages) = split_base_and_pages("Kárník, České země; p. 20—10");
        assert_eq!(base, "Kárník, České země");
        assert_eq!(pages, Some(vec![(10, 20)]));

        let (base, pages) = split_base_and_pages("Masaryk, Světová revoluce, ");
        assert_eq!(base, "Masaryk, Světová revoluce");
        assert_eq!(pages, None);
    }

    #[test]
    fn keys_ignore_case_nbsp_and_parens() {
        assert_eq!(canon_key("  Beneš,\u{00A0}Paměti  "), "beneš, paměti");
        let idx = SourceIndex::build(&strings(&["Beneš, Paměti (Praha 1947)"]));
        assert!(idx.lookup("beneš, paměti").is_some());
        assert!(idx.lookup("BENEŠ, PAMĚTI (Praha 1947)").is_some());
        assert!(idx.lookup("Masaryk").is_none());
    }

    #[test]
    fn canonicalize_clamps_and_fills_pages() {
        let available = strings(&["Klimek, Boj o Hrad, pp. 100–120, 200–220", "Masaryk, Světová revoluce"]);
        let refs = strings(&[
            "klimek, boj o hrad, p. 95-105",
            "Klimek, Boj o Hrad",
            "Klimek, Boj o Hrad, pp. 500-510",
            "MASARYK, Světová revoluce, pp. 3-4",
            "Neznámý, Kniha",
        ]);
        let fixed = canonicalize_msp_sources(&refs, &available);
        assert_eq!(
            fixed,
            vec![
                "Klimek, Boj o Hrad, pp. 100–105",
                "Klimek, Boj o Hrad, pp. 100–120",
                "Klimek, Boj o Hrad, pp. 100–120",
                "Masaryk, Světová revoluce",
                "Neznámý, Kniha",
            ]
        );
    }

    #[test]
    fn reference_checks() {
        let available = strings(&["Klimek, Boj o Hrad, pp. 100–120", "Masaryk, Světová revoluce"]);
        let idx = SourceIndex::build(&available);
        assert!(check_references(1, &strings(&["Klimek, Boj o Hrad, pp. 101–110"]), &idx, &available).is_ok());
        assert!(check_references(1, &[], &idx, &available).unwrap_err().contains("at least one source"));
        let err = check_references(2, &strings(&["Klimek, Boj o Hrad, pp. 90–110"]), &idx, &available).unwrap_err();
        assert!(err.contains("outside available ranges"));
        let err = check_references(3, &strings(&["Masaryk, Světová revoluce, p. 1-2"]), &idx, &available).unwrap_err();
        assert!(err.contains("must not specify pages"));
        let err = check_references(4, &strings(&["Klimek, Boj o Hrad"]), &idx, &available).unwrap_err();
        assert!(err.contains("must specify page subrange"));
    }

    #[test]
    fn parsed_reply_is_rewritten_in_place() {
        let mut parsed = serde_json::json!({
            "episodes": [{
                "sources_used": ["Pekař, Dějiny, pp. 10–30"],
                "msp": [{"sources_segment": ["pekař, dějiny, pp. 12-14"]}, {"sources_segment": []}]
            }]
        });
        canonicalize_parsed_citations(&mut parsed);
        assert_eq!(parsed["episodes"][0]["msp"][0]["sources_segment"][0], "Pekař, Dějiny, pp. 12–14");
        assert_eq!(parsed["episodes"][0]["msp"][1]["sources_segment"], serde_json::json!([]));
    }
}
