use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active jobs count toward the queue depth shown to the user.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing | Self::Paused)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    #[default]
    Baseline,
    Tuning,
    TestPipeline,
}

impl PipelineMode {
    pub fn wants_artifacts(&self) -> bool {
        matches!(self, Self::Tuning | Self::TestPipeline)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Wav,
    #[default]
    Mp3,
    Ogg,
}

impl OutputFormat {
    /// Unknown format strings fall back to WAV.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "mp3" => Self::Mp3,
            "ogg" => Self::Ogg,
            _ => Self::Wav,
        }
    }

    pub fn ext(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
        }
    }
}

/// Per-speaker voice selection. `audio_prompt_path` names a file inside the
/// reference audio folder; `lang_code` overrides the global default language.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct VoiceAssignment {
    #[serde(default)]
    pub audio_prompt_path: Option<String>,
    #[serde(default)]
    pub lang_code: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub title: String,
    pub text: String,
    /// Empty means the whole text is processed as chapter 0.
    pub chapters: Vec<String>,
    pub voice_assignments: HashMap<String, VoiceAssignment>,
    pub output_format: OutputFormat,
    pub output_bitrate_kbps: u32,
    pub pipeline_mode: PipelineMode,

    pub status: JobStatus,
    pub progress: u8,
    pub current_chunk: u32,
    pub total_chunks: u32,
    pub current_chapter: u32,
    pub total_chapters: u32,
    pub completed_chapters: u32,
    pub output_files: Vec<String>,
    pub error: Option<String>,
    pub worker_name: Option<String>,

    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl Job {
    /// Text of the chapter at `index`, falling back to the whole job text for
    /// single-chapter jobs created without an explicit chapter list.
    pub fn chapter_text(&self, index: usize) -> Option<&str> {
        if self.chapters.is_empty() {
            if index == 0 {
                Some(&self.text)
            } else {
                None
            }
        } else {
            self.chapters.get(index).map(|s| s.as_str())
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChapterState {
    pub job_id: String,
    pub chapter_index: u32,
    pub worker_name: String,
    pub current_chunk: u32,
    pub total_chunks: u32,
    pub status: ChapterStatus,
    pub updated_at: String,
}
