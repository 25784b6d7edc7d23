use async_trait::async_trait;
use log::{info, warn};
use std::collections::HashSet;

use crate::core::config::ArtifactsConfig;

/// Optional neural denoise backend. Returns a fully denoised ("wet") signal;
/// the pipeline blends it with the original by the configured strength.
#[async_trait]
pub trait Denoiser: Send + Sync {
    async fn denoise(&self, samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<f32>>;
}

/// Optional transcription backend used for post-synthesis validation.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> anyhow::Result<String>;
}

const FRAME_LENGTH: usize = 2048;
const HOP_LENGTH: usize = 512;
const TEST_TRIM_THRESHOLD: f32 = 4.0;
const TEST_TRIM_MARGIN: f32 = 0.2;

/// Artifact reduction over a single chunk waveform. Fixed stage order:
/// denoise, silence trimming, transcription validation. Every stage tolerates
/// a missing collaborator or an internal failure by passing the audio through
/// with a warning; this pipeline never fails a chapter.
pub struct ArtifactPipeline {
    config: ArtifactsConfig,
    denoiser: Option<Box<dyn Denoiser>>,
    transcriber: Option<Box<dyn Transcriber>>,
}

impl ArtifactPipeline {
    pub fn new(
        config: ArtifactsConfig,
        denoiser: Option<Box<dyn Denoiser>>,
        transcriber: Option<Box<dyn Transcriber>>,
    ) -> Self {
        Self {
            config,
            denoiser,
            transcriber,
        }
    }

    pub async fn apply(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        expected_text: &str,
        test_mode: bool,
    ) -> Vec<f32> {
        if (!test_mode && !self.config.enabled) || samples.is_empty() {
            return samples;
        }

        let mut audio = samples;

        if self.config.denoise_enabled {
            audio = self.denoise_stage(audio, sample_rate).await;
        }

        if test_mode || self.config.trim_enabled {
            let (threshold, margin) = if test_mode {
                (TEST_TRIM_THRESHOLD, TEST_TRIM_MARGIN)
            } else {
                (self.config.trim_threshold, self.config.trim_margin)
            };
            audio = trim_silence(&audio, sample_rate, threshold, margin);
        }

        if self.config.whisper_enabled && !expected_text.is_empty() && !test_mode {
            self.validate_stage(&audio, sample_rate, expected_text).await;
        }

        audio
    }

    async fn denoise_stage(&self, audio: Vec<f32>, sample_rate: u32) -> Vec<f32> {
        let Some(denoiser) = &self.denoiser else {
            warn!("Denoiser not available, skipping denoise stage");
            return audio;
        };
        let strength = self.config.denoise_strength.clamp(0.0, 1.0);
        if strength == 0.0 {
            return audio;
        }
        match denoiser.denoise(&audio, sample_rate).await {
            Ok(wet) if wet.len() == audio.len() => {
                info!("Denoise applied with strength {strength}");
                audio
                    .iter()
                    .zip(wet.iter())
                    .map(|(dry, wet)| dry * (1.0 - strength) + wet * strength)
                    .collect()
            }
            Ok(_) => {
                warn!("Denoiser returned a different length, skipping denoise stage");
                audio
            }
            Err(e) => {
                warn!("Denoiser error, passing audio through: {e}");
                audio
            }
        }
    }

    async fn validate_stage(&self, audio: &[f32], sample_rate: u32, expected_text: &str) {
        let Some(transcriber) = &self.transcriber else {
            warn!("Transcriber not available, skipping validation stage");
            return;
        };
        match transcriber.transcribe(audio, sample_rate).await {
            Ok(heard) => {
                let ratio = token_similarity(expected_text, &heard);
                if ratio < 0.5 {
                    warn!(
                        "Transcription mismatch (similarity {ratio:.2}): expected {expected_text:?}, got {heard:?}"
                    );
                } else {
                    info!("Transcription validation passed (similarity {ratio:.2})");
                }
            }
            Err(e) => warn!("Transcription error, skipping validation: {e}"),
        }
    }
}

/// Removes silent stretches by framewise energy, keeping `margin` seconds
/// around each retained interval and merging overlaps before slicing.
/// `threshold` is a percentage of peak amplitude; audio entirely below it is
/// returned unmodified.
pub fn trim_silence(samples: &[f32], sample_rate: u32, threshold: f32, margin: f32) -> Vec<f32> {
    let intervals = active_intervals(samples, threshold);
    if intervals.is_empty() {
        info!("Silence trimmer: audio entirely below threshold, returning unmodified");
        return samples.to_vec();
    }

    let margin_samples = (margin * sample_rate as f32) as usize;
    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (start, end) in intervals {
        let start = start.saturating_sub(margin_samples);
        let end = (end + margin_samples).min(samples.len());
        match merged.last_mut() {
            Some((_, prev_end)) if start <= *prev_end => *prev_end = (*prev_end).max(end),
            _ => merged.push((start, end)),
        }
    }

    info!(
        "Silence trimmed (threshold: {threshold}%, margin: {margin}s), {} intervals kept",
        merged.len()
    );
    let mut out = Vec::new();
    for (start, end) in merged {
        out.extend_from_slice(&samples[start..end]);
    }
    out
}

/// Frames with RMS above `threshold` percent of the peak frame RMS, as
/// half-open sample intervals.
fn active_intervals(samples: &[f32], threshold: f32) -> Vec<(usize, usize)> {
    if samples.is_empty() {
        return Vec::new();
    }
    let mut rms = Vec::new();
    let mut start = 0;
    while start < samples.len() {
        let end = (start + FRAME_LENGTH).min(samples.len());
        let frame = &samples[start..end];
        let energy: f32 = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
        rms.push(energy.sqrt());
        start += HOP_LENGTH;
    }

    let peak = rms.iter().cloned().fold(0.0f32, f32::max);
    if peak <= 0.0 {
        return Vec::new();
    }
    let cutoff = peak * (threshold.max(0.01) / 100.0);

    let mut intervals = Vec::new();
    let mut active_start: Option<usize> = None;
    for (i, value) in rms.iter().enumerate() {
        if *value > cutoff {
            if active_start.is_none() {
                active_start = Some(i * HOP_LENGTH);
            }
        } else if let Some(begin) = active_start.take() {
            let end = ((i - 1) * HOP_LENGTH + FRAME_LENGTH).min(samples.len());
            intervals.push((begin, end));
        }
    }
    if let Some(begin) = active_start {
        intervals.push((begin, samples.len()));
    }
    intervals
}

/// Case-insensitive token overlap in [0, 1]; cheap stand-in for a proper
/// sequence-similarity ratio, only used to decide whether to log a warning.
fn token_similarity(expected: &str, heard: &str) -> f32 {
    let tokens = |s: &str| -> HashSet<String> {
        s.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    };
    let a = tokens(expected);
    let b = tokens(heard);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let common = a.intersection(&b).count() as f32;
    2.0 * common / (a.len() + b.len()) as f32
}
