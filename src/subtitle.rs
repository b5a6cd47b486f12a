use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::audio::wav_duration_seconds;

const COMMA_PAUSE: f64 = 0.2;
const SENTENCE_END_PAUSE: f64 = 0.4;
const WORD_WEIGHT_ALPHA: f64 = 0.75;
const LINE_WIDTH: usize = 80;

static WORD_OR_PUNCT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\w[\w'-]*)|([,.!?])").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct SrtEntry {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Spreads `duration` seconds starting at `start` over the words of `text`.
/// Punctuation takes a fixed pause; words share the rest by `len^0.75`.
pub fn time_words(text: &str, start: f64, duration: f64) -> Vec<SrtEntry> {
    let elements: Vec<&str> = WORD_OR_PUNCT.find_iter(text).map(|m| m.as_str()).collect();
    if elements.is_empty() {
        return vec![SrtEntry { start, end: start + duration, text: text.to_string() }];
    }
    let mut total_pause_time = 0.0;
    let mut total_weight = 0.0;
    for &element in &elements {
        match element {
            "," => total_pause_time += COMMA_PAUSE,
            "." | "!" | "?" => total_pause_time += SENTENCE_END_PAUSE,
            word => total_weight += (word.chars().count() as f64).powf(WORD_WEIGHT_ALPHA),
        }
    }
    let word_time_available = (duration - total_pause_time).max(0.0);
    let mut entries = Vec::new();
    let mut current = start;
    for element in elements {
        match element {
            "," => current += COMMA_PAUSE,
            "." | "!" | "?" => current += SENTENCE_END_PAUSE,
            word => {
                let weight = (word.chars().count() as f64).powf(WORD_WEIGHT_ALPHA);
                let word_duration = if total_weight > 0.0 { word_time_available * weight / total_weight } else { 0.0 };
                entries.push(SrtEntry { start: current, end: current + word_duration, text: word.to_string() });
                current += word_duration;
            }
        }
    }
    entries
}

/// Word-level entries for consecutive WAV parts and the text each one speaks.
pub fn build_srt_entries(parts: &[(PathBuf, String)]) -> anyhow::Result<Vec<SrtEntry>> {
    let mut srt_entries = Vec::new();
    let mut cumulative_seconds = 0.0_f64;
    for (part, chunk_text) in parts {
        let dur = wav_duration_seconds(part)?;
        srt_entries.extend(time_words(chunk_text, cumulative_seconds, dur));
        cumulative_seconds += dur;
    }
    Ok(srt_entries)
}

pub fn write_srt(path: &Path, entries: &[SrtEntry]) -> anyhow::Result<()> {
    let mut f = File::create(path)?;
    for (i, entry) in entries.iter().enumerate() {
        writeln!(f, "{}", i + 1)?;
        writeln!(f, "{} --> {}", format_srt_time(entry.start), format_srt_time(entry.end))?;
        for line in wrap_text(&entry.text, LINE_WIDTH) {
            writeln!(f, "{}", line)?;
        }
        writeln!(f)?;
    }
    Ok(())
}

fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let (h, rem) = (total_ms / 3_600_000, total_ms % 3_600_000);
    format!("{:02}:{:02}:{:02},{:03}", h, rem / 60_000, (rem / 1000) % 60, rem % 1000)
}

fn wrap_text(s: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in s.split_whitespace() {
        if current.len() + word.len() + 1 > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        } else if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::write_pcm16_wav;
    use tempfile::TempDir;

    #[test]
    fn pauses_and_weights_fill_the_duration() {
        let entries = time_words("Ahoj, světe.", 1.0, 2.0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "Ahoj");
        assert_eq!(entries[0].start, 1.0);
        // second word starts after the comma pause
        assert!((entries[1].start - (entries[0].end + COMMA_PAUSE)).abs() < 1e-9);
        // words plus pauses cover the whole span
        assert!((entries[1].end + SENTENCE_END_PAUSE - 3.0).abs() < 1e-9);
        let a = entries[0].end - entries[0].start;
        let b = entries[1].end - entries[1].start;
        assert!(b > a);
    }

    #[test]
    fn text_without_words_spans_the_part() {
        let entries = time_words("…", 0.0, 1.5);
        assert_eq!(entries, vec![SrtEntry { start: 0.0, end: 1.5, text: "…".into() }]);
    }

    #[test]
    fn srt_time_and_wrapping() {
        assert_eq!(format_srt_time(3723.4567), "01:02:03,457");
        let long = vec!["word"; 30].join(" ");
        let lines = wrap_text(&long, 20);
        assert!(lines.iter().all(|l| l.len() <= 20));
        assert_eq!(lines.join(" "), long);
    }

    #[test]
    fn parts_are_laid_end_to_end() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.wav");
        let b = tmp.path().join("b.wav");
        write_pcm16_wav(&vec![0u8; 16_000], 8_000, &a).unwrap();
        write_pcm16_wav(&vec![0u8; 8_000], 8_000, &b).unwrap();
        let entries = build_srt_entries(&[(a, "Jedna".into()), (b, "Dvě".into())]).unwrap();
        assert_eq!(entries.len(), 2);
        assert!((entries[1].start - 1.0).abs() < 1e-9);
        assert!((entries[1].end - 1.5).abs() < 1e-9);

        let srt = tmp.path().join("x.srt");
        write_srt(&srt, &entries).unwrap();
        let body = std::fs::read_to_string(srt).unwrap();
        assert!(body.starts_with("1\n00:00:00,000 --> 00:00:01,000\nJedna\n\n2\n"));
    }
}
