use anyhow::{bail, Result};
use log::info;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::config::Config;
use crate::core::job::{Job, JobStatus, OutputFormat, PipelineMode, VoiceAssignment};
use crate::core::store::{JobStore, JobUpdate};
use crate::services::queue::WorkQueue;

const TITLE_MAX_CHARS: usize = 50;

/// Submission payload for a new job.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub title: Option<String>,
    pub text: String,
    pub chapters: Vec<String>,
    pub voice_assignments: HashMap<String, VoiceAssignment>,
    pub output_format: OutputFormat,
    pub output_bitrate_kbps: u32,
    pub pipeline_mode: PipelineMode,
}

/// Front door of the pipeline: accepts jobs, fans chapters out to the work
/// queue, and drives the pause/resume/cancel control plane. Fan-in lives in
/// the store's completion counter, so the coordinator never blocks on a job.
pub struct JobCoordinator {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    config: Config,
}

impl JobCoordinator {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn WorkQueue>, config: Config) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Persists the job as `queued` and enqueues one task per chapter. A job
    /// without an explicit chapter list is a single chapter covering the
    /// whole text.
    pub async fn create_job(&self, new: NewJob) -> Result<String> {
        if new.chapters.iter().all(|c| c.trim().is_empty()) && new.text.trim().is_empty() {
            bail!("No text provided");
        }

        let title = new
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| derive_title(&new.text, &new.chapters));
        let job_id = Uuid::new_v4().to_string();
        let total_chapters = new.chapters.len().max(1) as u32;

        let job = Job {
            job_id: job_id.clone(),
            title,
            text: new.text,
            chapters: new.chapters,
            voice_assignments: new.voice_assignments,
            output_format: new.output_format,
            output_bitrate_kbps: new.output_bitrate_kbps,
            pipeline_mode: new.pipeline_mode,
            status: JobStatus::Queued,
            progress: 0,
            current_chunk: 0,
            total_chunks: 0,
            current_chapter: 0,
            total_chapters,
            completed_chapters: 0,
            output_files: vec![],
            error: None,
            worker_name: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            started_at: None,
            completed_at: None,
        };
        self.store.create_job(job).await?;

        for chapter_index in 0..total_chapters {
            self.queue.enqueue_chapter(&job_id, chapter_index).await?;
        }
        info!("Created job {job_id} with {total_chapters} chapters");
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.store.get_job(job_id).await
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        self.store.list_jobs(status).await
    }

    pub async fn active_job_count(&self) -> Result<usize> {
        self.store.active_job_count().await
    }

    /// Pauses an active job. Workers observe the status within one chunk's
    /// latency and hold at the next chunk boundary.
    pub async fn pause_job(&self, job_id: &str) -> Result<()> {
        let job = self.require_job(job_id).await?;
        match job.status {
            JobStatus::Queued | JobStatus::Processing => {
                self.store
                    .update_job(job_id, JobUpdate::default().status(JobStatus::Paused))
                    .await?;
                info!("Paused job {job_id}");
                Ok(())
            }
            other => bail!("Cannot pause job in state {other:?}"),
        }
    }

    pub async fn resume_job(&self, job_id: &str) -> Result<()> {
        let job = self.require_job(job_id).await?;
        if job.status != JobStatus::Paused {
            bail!("Cannot resume job in state {:?}", job.status);
        }
        self.store
            .update_job(job_id, JobUpdate::default().status(JobStatus::Processing))
            .await?;
        info!("Resumed job {job_id}");
        Ok(())
    }

    /// Cancellation is terminal and sticks: a cancelled job never becomes
    /// `completed`, even if some chapters already wrote their files.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let job = self.require_job(job_id).await?;
        if job.status.is_terminal() {
            bail!("Cannot cancel job in state {:?}", job.status);
        }
        self.store
            .update_job(job_id, JobUpdate::default().status(JobStatus::Cancelled))
            .await?;
        info!("Cancelled job {job_id}");
        Ok(())
    }

    /// Removes the job record, its chapter rows, and its output directory.
    /// Returns false when no such job existed.
    pub async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let deleted = self.store.delete_job(job_id).await?;
        if deleted {
            let dir = self.config.job_output_dir(job_id);
            if dir.exists() {
                tokio::fs::remove_dir_all(&dir).await?;
            }
            info!("Deleted job {job_id}");
        }
        Ok(deleted)
    }

    async fn require_job(&self, job_id: &str) -> Result<Job> {
        match self.store.get_job(job_id).await? {
            Some(job) => Ok(job),
            None => bail!("Job {job_id} not found"),
        }
    }
}

/// First non-empty line of the text (or first chapter), capped at 50 chars.
fn derive_title(text: &str, chapters: &[String]) -> String {
    let source = if text.trim().is_empty() {
        chapters.iter().map(|c| c.as_str()).find(|c| !c.trim().is_empty())
    } else {
        Some(text)
    };
    source
        .and_then(|s| s.lines().map(str::trim).find(|l| !l.is_empty()))
        .map(|line| line.chars().take(TITLE_MAX_CHARS).collect())
        .unwrap_or_else(|| "Untitled".to_string())
}
