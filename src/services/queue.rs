use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::services::worker::ChapterWorker;

/// One unit of work: a single chapter of a job. Delivery is at-least-once;
/// the store's idempotent completion counter absorbs duplicates.
#[derive(Debug, Clone)]
pub struct ChapterTask {
    pub job_id: String,
    pub chapter_index: u32,
}

/// Dispatch seam between the coordinator and the workers. The in-process
/// implementation below is a channel; a deployment spanning hosts implements
/// this over a real message broker.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue_chapter(&self, job_id: &str, chapter_index: u32) -> Result<()>;
}

/// In-process queue: an unbounded channel drained by a pool of consumer
/// tasks, one per `ChapterWorker`. Tasks for different chapters of the same
/// job land on whichever worker is free, so chapters run concurrently.
pub struct LocalQueue {
    tx: mpsc::UnboundedSender<ChapterTask>,
}

impl LocalQueue {
    pub fn start(workers: Vec<Arc<ChapterWorker>>) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::unbounded_channel::<ChapterTask>();
        let rx = Arc::new(Mutex::new(rx));

        let handles = workers
            .into_iter()
            .map(|worker| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    info!("Worker {} started", worker.name());
                    loop {
                        // Hold the lock only while receiving so consumers
                        // process tasks in parallel.
                        let task = { rx.lock().await.recv().await };
                        let Some(task) = task else {
                            break;
                        };
                        debug!(
                            "Worker {} picked up job {} chapter {}",
                            worker.name(),
                            task.job_id,
                            task.chapter_index
                        );
                        worker.process_chapter(&task.job_id, task.chapter_index).await;
                    }
                    info!("Worker {} stopped", worker.name());
                })
            })
            .collect();

        (Arc::new(Self { tx }), handles)
    }
}

#[async_trait]
impl WorkQueue for LocalQueue {
    async fn enqueue_chapter(&self, job_id: &str, chapter_index: u32) -> Result<()> {
        self.tx
            .send(ChapterTask {
                job_id: job_id.to_string(),
                chapter_index,
            })
            .context("Work queue is shut down")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ArtifactsConfig, Config};
    use crate::core::job::JobStatus;
    use crate::core::store::{JobStore, JsonStore};
    use crate::services::artifacts::ArtifactPipeline;
    use crate::services::engine::SilenceEngine;
    use std::time::Duration;

    fn spawn_pool(
        store: Arc<dyn JobStore>,
        config: &Config,
        count: usize,
    ) -> (Arc<LocalQueue>, Vec<JoinHandle<()>>) {
        let workers = (0..count)
            .map(|i| {
                Arc::new(ChapterWorker::new(
                    store.clone(),
                    Arc::new(SilenceEngine::new(24000)),
                    Arc::new(ArtifactPipeline::new(ArtifactsConfig::default(), None, None)),
                    config.clone(),
                    format!("worker-{i}"),
                ))
            })
            .collect();
        LocalQueue::start(workers)
    }

    #[tokio::test]
    async fn test_tasks_for_unknown_jobs_are_absorbed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = Config::default();
        config.data_folder = dir.path().join("data").to_string_lossy().to_string();
        config.output_folder = dir.path().join("outputs").to_string_lossy().to_string();
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));

        let (queue, handles) = spawn_pool(store.clone(), &config, 2);
        for i in 0..4 {
            queue.enqueue_chapter("ghost", i).await?;
        }
        drop(queue);
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(10), handle).await??;
        }
        assert!(store.get_job("ghost").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_pool_drains_queued_chapters() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = Config::default();
        config.data_folder = dir.path().join("data").to_string_lossy().to_string();
        config.output_folder = dir.path().join("outputs").to_string_lossy().to_string();
        config.generation.sentence_pause_ms = 0;
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));

        let job = crate::core::job::Job {
            job_id: "j1".to_string(),
            title: "Test".to_string(),
            text: String::new(),
            chapters: vec!["Rozdział pierwszy.".into(), "Rozdział drugi.".into()],
            voice_assignments: std::collections::HashMap::new(),
            output_format: crate::core::job::OutputFormat::Wav,
            output_bitrate_kbps: 128,
            pipeline_mode: crate::core::job::PipelineMode::Baseline,
            status: JobStatus::Queued,
            progress: 0,
            current_chunk: 0,
            total_chunks: 0,
            current_chapter: 0,
            total_chapters: 2,
            completed_chapters: 0,
            output_files: vec![],
            error: None,
            worker_name: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            started_at: None,
            completed_at: None,
        };
        store.create_job(job).await?;

        let (queue, handles) = spawn_pool(store.clone(), &config, 2);
        queue.enqueue_chapter("j1", 0).await?;
        queue.enqueue_chapter("j1", 1).await?;
        drop(queue);
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(10), handle).await??;
        }

        let job = store.get_job("j1").await?.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_chapters, 2);
        Ok(())
    }
}
