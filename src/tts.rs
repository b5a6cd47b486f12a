//! Text-to-speech through the ElevenLabs API: sentence chunking, synthesis
//! with retry, audio files per chunk and an estimated SRT for WAV output.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, error, info, warn};

use crate::args::TtsArgs;
use crate::audio::{pcm_sample_rate, write_pcm16_wav};
use crate::config::{AppConfig, ElevenLabsSettings, VoiceSettings, require_api_key};
use crate::error::PipelineError;
use crate::events::{Event, emit};
use crate::lang::Language;
use crate::llm::RetryPolicy;
use crate::paths::{PathResolver, Stage, derive_episode_location};
use crate::subtitle::{build_srt_entries, write_srt};

pub const DEFAULT_MAX_CHARS: usize = 9000;
pub const PRICE_PER_1K_CHARS: f64 = 0.30;

static SENTENCE_END: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[.!?]\s+").unwrap());

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("TTS request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("TTS provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("TTS provider returned no audio")]
    EmptyAudio,

    #[error("could not write audio: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not write WAV: {0}")]
    Wav(#[from] hound::Error),
}

impl TtsError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TtsError::Request(_) | TtsError::EmptyAudio => true,
            TtsError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut last = 0;
    for m in SENTENCE_END.find_iter(text) {
        out.push(&text[last..m.start() + 1]);
        last = m.end();
    }
    out.push(&text[last..]);
    out.into_iter().filter(|s| !s.trim().is_empty()).collect()
}

/// Groups sentences into chunks; a sentence joins the current chunk only while
/// the chunk plus the sentence and a separator stays under `max_chars`.
pub fn split_for_tts(text: &str, max_chars: usize) -> Vec<String> {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        warn!("no text to split for TTS");
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for s in sentences {
        let len = s.chars().count();
        if current_len + len + 1 < max_chars {
            current.push_str(s);
            current.push(' ');
            current_len += len + 1;
        } else {
            if !current.is_empty() {
                chunks.push(current.trim().to_string());
            }
            current = format!("{s} ");
            current_len = len + 1;
        }
    }
    if !current.is_empty() {
        chunks.push(current.trim().to_string());
    }
    for (i, c) in chunks.iter().enumerate() {
        debug!("TTS part {}: {} chars", i + 1, c.chars().count());
    }
    chunks
}

pub fn calculate_cost(chars: usize) -> f64 {
    let raw = chars as f64 / 1000.0 * PRICE_PER_1K_CHARS;
    (raw * 10_000.0).round() / 10_000.0
}

pub fn extension_for(output_format: &str) -> &'static str {
    if output_format.starts_with("mp3") {
        "mp3"
    } else if output_format.starts_with("opus") {
        "opus"
    } else if ["pcm", "ulaw_", "alaw_"].iter().any(|p| output_format.starts_with(p)) {
        "wav"
    } else {
        "bin"
    }
}

/// `"1,3"` (1-based) to 0-based indices, each checked against `count`.
pub fn parse_parts(spec: &str, count: usize) -> Result<Vec<usize>, PipelineError> {
    let mut out = Vec::new();
    for raw in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let n: usize = raw.parse().map_err(|_| PipelineError::Validation(format!("invalid part number {raw:?}")))?;
        if n == 0 || n > count {
            return Err(PipelineError::Validation(format!("part {n} out of range 1..={count}")));
        }
        if !out.contains(&(n - 1)) {
            out.push(n - 1);
        }
    }
    Ok(out)
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        model: &str,
        settings: &VoiceSettings,
        output_format: &str,
    ) -> Result<Vec<u8>, TtsError>;
}

#[derive(Serialize)]
struct SpeechBody<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: &'a VoiceSettings,
}

pub struct ElevenLabsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl ElevenLabsClient {
    pub fn new(settings: &ElevenLabsSettings, api_key: String) -> Result<Self, TtsError> {
        let http = reqwest::Client::builder().timeout(Duration::from_secs(300)).build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            retry: RetryPolicy::tts(),
        })
    }

    async fn send(
        &self,
        text: &str,
        voice_id: &str,
        model: &str,
        settings: &VoiceSettings,
        output_format: &str,
    ) -> Result<Vec<u8>, TtsError> {
        let body = SpeechBody { text, model_id: model, voice_settings: settings };
        let res = self
            .http
            .post(format!("{}/v1/text-to-speech/{}", self.base_url, voice_id))
            .query(&[("output_format", output_format)])
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(TtsError::Status { status: status.as_u16(), body });
        }
        let audio = res.bytes().await?;
        if audio.is_empty() {
            return Err(TtsError::EmptyAudio);
        }
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsClient {
    async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        model: &str,
        settings: &VoiceSettings,
        output_format: &str,
    ) -> Result<Vec<u8>, TtsError> {
        Retry::spawn(self.retry.strategy(), || async move {
            match self.send(text, voice_id, model, settings, output_format).await {
                Ok(audio) => Ok(audio),
                Err(e) if e.is_retryable() => {
                    warn!("elevenlabs: transient error, will retry: {}", e);
                    Err(RetryError::Transient { err: e, retry_after: None })
                }
                Err(e) => Err(RetryError::Permanent(e)),
            }
        })
        .await
    }
}

/// Everything a synthesis run needs besides the text.
#[derive(Debug, Clone)]
pub struct VoiceRequest {
    pub voice_id: String,
    pub model: String,
    pub settings: VoiceSettings,
    pub output_format: String,
}

fn write_audio(bytes: &[u8], output_format: &str, path: &Path) -> Result<(), TtsError> {
    if output_format.starts_with("pcm") {
        write_pcm16_wav(bytes, pcm_sample_rate(output_format), path)?;
    } else {
        fs::write(path, bytes)?;
    }
    Ok(())
}

/// Synthesizes the selected chunks (all when `selected` is empty) into
/// `out_dir/ep_{episode}_part_{NN}.{ext}`. Failed chunks are logged and skipped;
/// the returned list pairs each produced file with its chunk index.
pub async fn generate_audio(
    synth: &dyn SpeechSynthesizer,
    chunks: &[String],
    out_dir: &Path,
    episode: &str,
    voice: &VoiceRequest,
    selected: &[usize],
) -> Result<Vec<(usize, PathBuf)>> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let ext = extension_for(&voice.output_format);
    let indices: Vec<usize> = if selected.is_empty() { (0..chunks.len()).collect() } else { selected.to_vec() };
    let mut produced = Vec::new();
    for idx in indices {
        let Some(text) = chunks.get(idx) else {
            warn!("part {} does not exist, skipping", idx + 1);
            continue;
        };
        let out_file = out_dir.join(format!("ep_{}_part_{:02}.{}", episode, idx + 1, ext));
        let result = async {
            let audio = synth.synthesize(text, &voice.voice_id, &voice.model, &voice.settings, &voice.output_format).await?;
            write_audio(&audio, &voice.output_format, &out_file)
        }
        .await;
        match result {
            Ok(()) => {
                info!("generated {}", out_file.display());
                produced.push((idx, out_file));
            }
            Err(e) => {
                error!("skipping {}: {}", out_file.display(), e);
                emit(Event::Warn { message: format!("part {} failed: {e}", idx + 1) });
            }
        }
    }
    Ok(produced)
}

fn resolve_voice(args: &TtsArgs, settings: &ElevenLabsSettings, lang: Language) -> Result<VoiceRequest, PipelineError> {
    let voice_id = args
        .voice_id
        .clone()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| settings.voice_id(lang).map(str::to_string))
        .ok_or_else(|| PipelineError::Validation(format!("no voice id for {lang}: pass --voice-id or set elevenlabs.voice_ids.{lang}")))?;
    Ok(VoiceRequest {
        voice_id,
        model: settings.model.clone(),
        settings: settings.voice_settings_for(lang),
        output_format: args.format.clone().unwrap_or_else(|| settings.output_format.clone()),
    })
}

fn default_output_dir(input: &Path) -> PathBuf {
    let loc = derive_episode_location(input.parent().unwrap_or(Path::new(".")));
    PathResolver::root(Stage::Tts).join(loc.topic).join(loc.lang).join(loc.episode)
}

pub async fn run(args: &TtsArgs, app: &AppConfig) -> Result<()> {
    emit(Event::phase("start"));
    let text = fs::read_to_string(&args.input).with_context(|| format!("reading {}", args.input.display()))?;
    if text.trim().is_empty() {
        return Err(PipelineError::Validation(format!("{} is empty", args.input.display())).into());
    }
    let voice = resolve_voice(args, &app.elevenlabs, args.language)?;
    let chunks = split_for_tts(text.trim(), args.max_chars);
    let selected = match &args.parts {
        Some(spec) => parse_parts(spec, chunks.len())?,
        None => Vec::new(),
    };
    let chars: usize = if selected.is_empty() {
        chunks.iter().map(|c| c.chars().count()).sum()
    } else {
        selected.iter().map(|&i| chunks[i].chars().count()).sum()
    };
    info!(
        "{} part(s), {} chars to synthesize, estimated cost ${:.4} (model {}, voice {})",
        chunks.len(),
        chars,
        calculate_cost(chars),
        voice.model,
        voice.voice_id
    );

    let out_dir = args.output_dir.clone().unwrap_or_else(|| default_output_dir(&args.input));
    let client = ElevenLabsClient::new(&app.elevenlabs, require_api_key("ELEVENLABS_API_KEY")?)?;
    emit(Event::phase("synthesizing"));
    let started = Instant::now();
    let produced = generate_audio(&client, &chunks, &out_dir, &args.episode, &voice, &selected).await?;
    emit(Event::Metrics {
        latency_sec: started.elapsed().as_secs_f64(),
        provider: "elevenlabs".to_string(),
        model: voice.model.clone(),
    });
    if produced.is_empty() {
        return Err(PipelineError::Provider("no audio part was produced".into()).into());
    }
    for (_, p) in &produced {
        emit(Event::OutputPath { value: p.display().to_string() });
    }

    if voice.output_format.starts_with("pcm") {
        let parts: Vec<(PathBuf, String)> = produced.iter().map(|(i, p)| (p.clone(), chunks[*i].clone())).collect();
        let srt_path = out_dir.join(format!("ep_{}.srt", args.episode));
        match build_srt_entries(&parts).and_then(|entries| write_srt(&srt_path, &entries)) {
            Ok(()) => {
                info!("subtitles written to {}", srt_path.display());
                emit(Event::OutputPath { value: srt_path.display().to_string() });
            }
            Err(e) => warn!("could not write subtitles: {:#}", e),
        }
    }
    emit(Event::Done);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeSynth {
        fail_on: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeSynth {
        fn new(fail_on: &[&str]) -> Self {
            Self { fail_on: fail_on.iter().map(|s| s.to_string()).collect(), calls: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynth {
        async fn synthesize(&self, text: &str, _: &str, _: &str, _: &VoiceSettings, _: &str) -> Result<Vec<u8>, TtsError> {
            self.calls.lock().unwrap().push(text.to_string());
            if self.fail_on.contains(text) {
                return Err(TtsError::Status { status: 400, body: "bad".into() });
            }
            Ok(vec![0u8; 1600])
        }
    }

    fn voice(format: &str) -> VoiceRequest {
        VoiceRequest {
            voice_id: "v".into(),
            model: "eleven_multilingual_v2".into(),
            settings: VoiceSettings::default(),
            output_format: format.into(),
        }
    }

    #[test]
    fn chunks_respect_limit_and_keep_decimals() {
        let text = "První věta. Druhá věta! Verze 2.0 platí? Konec";
        assert_eq!(split_for_tts(text, 9000), vec![text.to_string()]);
        let chunks = split_for_tts(text, 25);
        assert_eq!(chunks, vec!["První věta. Druhá věta!", "Verze 2.0 platí? Konec"]);
        assert!(split_for_tts("   ", 100).is_empty());
    }

    #[test]
    fn oversized_sentence_stands_alone() {
        let chunks = split_for_tts("Krátká. Tohle je velmi dlouhá věta bez konce", 10);
        assert_eq!(chunks, vec!["Krátká.", "Tohle je velmi dlouhá věta bez konce"]);
    }

    #[test]
    fn cost_and_extensions() {
        assert_eq!(calculate_cost(1000), 0.3);
        assert_eq!(calculate_cost(12_345), 3.7035);
        assert_eq!(extension_for("mp3_44100_128"), "mp3");
        assert_eq!(extension_for("opus_48000_64"), "opus");
        assert_eq!(extension_for("pcm_24000"), "wav");
        assert_eq!(extension_for("ulaw_8000"), "wav");
        assert_eq!(extension_for("flac"), "bin");
    }

    #[test]
    fn parts_are_one_based() {
        assert_eq!(parse_parts("1, 3,3", 3).unwrap(), vec![0, 2]);
        assert!(parse_parts("0", 3).is_err());
        assert!(parse_parts("4", 3).is_err());
        assert!(parse_parts("x", 3).is_err());
    }

    #[test]
    fn retryable_statuses() {
        assert!(TtsError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(TtsError::Status { status: 502, body: String::new() }.is_retryable());
        assert!(!TtsError::Status { status: 401, body: String::new() }.is_retryable());
    }

    #[test]
    fn voice_id_falls_back_to_config() {
        let mut settings = ElevenLabsSettings::default();
        let args = TtsArgs {
            input: PathBuf::from("x.txt"),
            language: Language::Cs,
            episode: "001".into(),
            voice_id: None,
            format: None,
            parts: None,
            max_chars: DEFAULT_MAX_CHARS,
            output_dir: None,
        };
        assert!(resolve_voice(&args, &settings, Language::Cs).is_err());
        settings.voice_ids.insert("CS".into(), "cz-voice".into());
        let v = resolve_voice(&args, &settings, Language::Cs).unwrap();
        assert_eq!(v.voice_id, "cz-voice");
        assert_eq!(v.output_format, "mp3_44100_128");
        let explicit = TtsArgs { voice_id: Some("other".into()), format: Some("pcm_16000".into()), ..args };
        let v = resolve_voice(&explicit, &settings, Language::Cs).unwrap();
        assert_eq!(v.voice_id, "other");
        assert_eq!(v.output_format, "pcm_16000");
    }

    #[tokio::test]
    async fn failed_parts_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let synth = FakeSynth::new(&["Dva."]);
        let chunks: Vec<String> = vec!["Jedna.".into(), "Dva.".into(), "Tři.".into()];
        let produced = generate_audio(&synth, &chunks, tmp.path(), "007", &voice("mp3_44100_128"), &[]).await.unwrap();
        let names: Vec<String> =
            produced.iter().map(|(_, p)| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["ep_007_part_01.mp3", "ep_007_part_03.mp3"]);
        assert_eq!(synth.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn pcm_output_is_wrapped_as_wav() {
        let tmp = TempDir::new().unwrap();
        let synth = FakeSynth::new(&[]);
        let chunks: Vec<String> = vec!["Jedna.".into(), "Dva.".into()];
        let produced = generate_audio(&synth, &chunks, tmp.path(), "1", &voice("pcm_16000"), &[1]).await.unwrap();
        assert_eq!(produced.len(), 1);
        let (idx, path) = &produced[0];
        assert_eq!(*idx, 1);
        assert!(path.ends_with("ep_1_part_02.wav"));
        let d = crate::audio::wav_duration_seconds(path).unwrap();
        assert!((d - 0.05).abs() < 1e-9);
    }
}
