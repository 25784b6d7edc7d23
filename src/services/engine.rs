use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::Path;

use crate::core::config::Config;

/// One chunk of synthesized audio as mono f32 PCM.
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

#[derive(Debug, Clone)]
pub struct SynthesisParams {
    pub temperature: f32,
    pub exaggeration: f32,
    pub cfg_weight: f32,
    pub seed: u64,
    pub language: String,
}

impl SynthesisParams {
    pub fn from_config(config: &Config, language: Option<&str>) -> Self {
        let generation = &config.generation;
        Self {
            temperature: generation.temperature,
            exaggeration: generation.exaggeration,
            cfg_weight: generation.cfg_weight,
            seed: generation.seed,
            language: language.unwrap_or(&generation.language).to_string(),
        }
    }
}

/// Black-box neural synthesis backend. `Ok(None)` means the engine produced
/// no audio for this chunk, which the pipeline skips without error.
#[async_trait]
pub trait SynthesisEngine: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        prompt_path: Option<&Path>,
        params: &SynthesisParams,
    ) -> Result<Option<Synthesis>>;
}

pub fn create_engine(config: &Config) -> Result<Box<dyn SynthesisEngine>> {
    match config.engine.as_str() {
        "silence" => Ok(Box::new(SilenceEngine::new(config.generation.sample_rate))),
        other => Err(anyhow!("Unknown synthesis engine: {}", other)),
    }
}

/// Stand-in engine emitting silence proportional to the text length, so the
/// whole pipeline (chunking, pause/cancel, encoding, fan-in) can run without
/// a model. Real backends implement `SynthesisEngine` and register here.
pub struct SilenceEngine {
    sample_rate: u32,
}

impl SilenceEngine {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait]
impl SynthesisEngine for SilenceEngine {
    async fn synthesize(
        &self,
        text: &str,
        _prompt_path: Option<&Path>,
        _params: &SynthesisParams,
    ) -> Result<Option<Synthesis>> {
        let chars = text.chars().count();
        if chars == 0 {
            return Ok(None);
        }
        // Roughly 60 ms of audio per character.
        let samples = (self.sample_rate as usize * chars * 60) / 1000;
        Ok(Some(Synthesis {
            samples: vec![0.0; samples],
            sample_rate: self.sample_rate,
        }))
    }
}
