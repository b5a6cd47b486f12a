use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

pub const DEFAULT_PCM_RATE: u32 = 44_100;

pub fn wav_duration_seconds(path: &Path) -> anyhow::Result<f64> {
    let reader = WavReader::open(path)?;
    let spec = reader.spec();
    let samples = reader.len();
    let frames = samples as f64 / spec.channels as f64;
    let duration = frames / spec.sample_rate as f64;
    Ok(duration)
}

/// Sample rate encoded in an output format name such as `pcm_22050`.
pub fn pcm_sample_rate(output_format: &str) -> u32 {
    output_format
        .rsplit('_')
        .next()
        .and_then(|r| r.parse().ok())
        .filter(|r| *r > 0)
        .unwrap_or(DEFAULT_PCM_RATE)
}

/// Wraps raw 16-bit little-endian mono PCM in a WAV container.
/// A trailing odd byte is dropped.
pub fn write_pcm16_wav(pcm: &[u8], sample_rate: u32, path: &Path) -> Result<(), hound::Error> {
    let spec = WavSpec { channels: 1, sample_rate, bits_per_sample: 16, sample_format: SampleFormat::Int };
    let mut writer = WavWriter::create(path, spec)?;
    for pair in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
    }
    writer.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rate_from_format_name() {
        assert_eq!(pcm_sample_rate("pcm_16000"), 16_000);
        assert_eq!(pcm_sample_rate("pcm_44100"), 44_100);
        assert_eq!(pcm_sample_rate("pcm"), DEFAULT_PCM_RATE);
    }

    #[test]
    fn pcm_roundtrips_to_expected_duration() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.wav");
        // half a second at 8 kHz, plus one stray byte
        let mut pcm = vec![0u8; 8_000];
        pcm.push(7);
        write_pcm16_wav(&pcm, 8_000, &path).unwrap();
        let d = wav_duration_seconds(&path).unwrap();
        assert!((d - 0.5).abs() < 1e-9);
    }
}
