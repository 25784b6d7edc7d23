use log::warn;

use crate::core::job::OutputFormat;

/// `duration_ms` of silence at `sample_rate`.
pub fn silence(duration_ms: u32, sample_rate: u32) -> Vec<f32> {
    let samples = (sample_rate as u64 * duration_ms as u64 / 1000) as usize;
    vec![0.0; samples]
}

pub fn concat(parts: &[Vec<f32>]) -> Vec<f32> {
    let total = parts.iter().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(total);
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

/// Time-stretches audio by `rate` using linear interpolation: rate > 1.0
/// shortens (faster speech), rate < 1.0 lengthens. Rates that are not finite
/// and positive return the input unchanged.
pub fn time_stretch(samples: &[f32], rate: f32) -> Vec<f32> {
    if !rate.is_finite() || rate <= 0.0 || rate == 1.0 || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = ((samples.len() as f64) / rate as f64).round().max(1.0) as usize;
    let mut out = Vec::with_capacity(out_len);
    let step = (samples.len() - 1) as f64 / (out_len.max(2) - 1) as f64;
    for i in 0..out_len {
        let pos = i as f64 * step;
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = samples[(idx + 1).min(samples.len() - 1)];
        out.push(a + (b - a) * frac);
    }
    out
}

/// Encodes mono f32 PCM to the requested container. WAV (PCM16) is produced
/// natively; mp3/ogg need an external codec, and without one the samples are
/// written as WAV bytes with a warning, matching the service's historical
/// fallback behavior.
pub fn encode(
    samples: &[f32],
    sample_rate: u32,
    format: OutputFormat,
    _bitrate_kbps: u32,
) -> Vec<u8> {
    match format {
        OutputFormat::Wav => encode_wav(samples, sample_rate),
        OutputFormat::Mp3 | OutputFormat::Ogg => {
            warn!(
                "No {} codec available, falling back to WAV encoding",
                format.ext()
            );
            encode_wav(samples, sample_rate)
        }
    }
}

/// Minimal PCM16 mono WAV writer: RIFF header, `fmt ` chunk, `data` chunk.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_size = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_size as usize);

    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_size).to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        let value = (clamped * i16::MAX as f32) as i16;
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf
}
