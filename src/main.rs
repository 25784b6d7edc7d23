use anyhow::{bail, Result};
use log::info;
use std::sync::Arc;
use std::time::Duration;

use lektor::core::config::Config;
use lektor::core::job::{JobStatus, OutputFormat, PipelineMode};
use lektor::core::store::{JobStore, JsonStore};
use lektor::services::artifacts::ArtifactPipeline;
use lektor::services::coordinator::{JobCoordinator, NewJob};
use lektor::services::engine::{create_engine, SynthesisEngine};
use lektor::services::queue::LocalQueue;
use lektor::services::worker::ChapterWorker;

/// Chapters in an input file are separated by a line containing only `---`.
fn split_chapters(text: &str) -> Vec<String> {
    let chapters: Vec<String> = text
        .split("\n---\n")
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if chapters.len() > 1 {
        chapters
    } else {
        Vec::new()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(input_path) = args.next() else {
        bail!("Usage: lektor <input.txt> [wav|mp3|ogg]");
    };
    let format = OutputFormat::parse(&args.next().unwrap_or_default());

    let config = Config::load()?;
    config.ensure_directories()?;

    let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
    let engine: Arc<dyn SynthesisEngine> = Arc::from(create_engine(&config)?);
    let artifacts = Arc::new(ArtifactPipeline::new(config.artifacts.clone(), None, None));

    let worker_count = config.worker_count.max(1);
    let workers = (0..worker_count)
        .map(|i| {
            Arc::new(ChapterWorker::new(
                store.clone(),
                engine.clone(),
                artifacts.clone(),
                config.clone(),
                format!("{}-{}", config.worker_name, i),
            ))
        })
        .collect();
    let (queue, handles) = LocalQueue::start(workers);
    info!("Started {worker_count} workers ({})", config.worker_name);

    let coordinator = JobCoordinator::new(store.clone(), queue.clone(), config.clone());

    let text = tokio::fs::read_to_string(&input_path).await?;
    let job_id = coordinator
        .create_job(NewJob {
            text: text.clone(),
            chapters: split_chapters(&text),
            output_format: format,
            output_bitrate_kbps: 128,
            pipeline_mode: PipelineMode::Baseline,
            ..NewJob::default()
        })
        .await?;
    info!("Submitted job {job_id} from {input_path}");

    loop {
        let Some(job) = store.get_job(&job_id).await? else {
            bail!("Job {job_id} disappeared");
        };
        if job.status.is_terminal() {
            match job.status {
                JobStatus::Completed => {
                    info!("Job {job_id} completed: {:?}", job.output_files);
                }
                JobStatus::Failed => {
                    bail!("Job {job_id} failed: {}", job.error.unwrap_or_default());
                }
                _ => info!("Job {job_id} ended in state {:?}", job.status),
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    drop(queue);
    drop(coordinator);
    for handle in handles {
        handle.await?;
    }
    Ok(())
}
