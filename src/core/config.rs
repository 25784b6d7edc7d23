use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub data_folder: String,
    pub output_folder: String,
    pub test_output_folder: String,
    pub reference_audio_folder: String,

    /// Synthesis backend selected by `services::engine::create_engine`.
    pub engine: String,

    /// Identifier recorded on jobs and chapter rows this process works on.
    /// Overridden by the LEKTOR_WORKER_NAME environment variable.
    pub worker_name: String,
    pub worker_count: usize,

    pub generation: GenerationConfig,
    pub artifacts: ArtifactsConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub chunk_size: usize,
    pub temperature: f32,
    pub exaggeration: f32,
    pub cfg_weight: f32,
    pub seed: u64,
    pub language: String,
    pub speed_factor: f32,
    pub sentence_pause_ms: u32,
    pub sample_rate: u32,
    pub default_voice: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub enabled: bool,
    pub denoise_enabled: bool,
    pub denoise_strength: f32,
    pub trim_enabled: bool,
    /// Energy threshold as a percentage of peak amplitude (0.1 - 10.0).
    pub trim_threshold: f32,
    /// Seconds of audio kept around each retained interval.
    pub trim_margin: f32,
    pub whisper_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_folder: "data".to_string(),
            output_folder: "outputs".to_string(),
            test_output_folder: "test_outputs".to_string(),
            reference_audio_folder: "reference_audio".to_string(),
            engine: "silence".to_string(),
            worker_name: std::env::var("LEKTOR_WORKER_NAME")
                .unwrap_or_else(|_| "local-worker".to_string()),
            worker_count: 2,
            generation: GenerationConfig::default(),
            artifacts: ArtifactsConfig::default(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            chunk_size: 450,
            temperature: 0.8,
            exaggeration: 0.5,
            cfg_weight: 0.5,
            seed: 0,
            language: "pl".to_string(),
            speed_factor: 1.0,
            sentence_pause_ms: 500,
            sample_rate: 24000,
            default_voice: None,
        }
    }
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            denoise_enabled: false,
            denoise_strength: 0.85,
            trim_enabled: false,
            trim_threshold: 4.0,
            trim_margin: 0.2,
            whisper_enabled: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path).context("Failed to read config.yml")?;
        let config: Config =
            serde_yaml_ng::from_str(&content).context("Failed to parse config.yml")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.data_folder)?;
        fs::create_dir_all(&self.output_folder)?;
        fs::create_dir_all(&self.test_output_folder)?;
        fs::create_dir_all(&self.reference_audio_folder)?;
        Ok(())
    }

    pub fn job_output_dir(&self, job_id: &str) -> PathBuf {
        Path::new(&self.output_folder).join(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.generation.chunk_size, 450);
        assert_eq!(config.generation.sentence_pause_ms, 500);
        assert_eq!(config.artifacts.trim_threshold, 4.0);
        assert!(!config.artifacts.enabled);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() -> Result<()> {
        let config: Config = serde_yaml_ng::from_str("engine: silence\nworker_count: 4\n")?;
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.generation.chunk_size, 450);
        Ok(())
    }
}
