use anyhow::{bail, Context, Result};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::Config;
use crate::core::job::{ChapterStatus, Job, JobStatus, PipelineMode};
use crate::core::store::{JobStore, JobUpdate};
use crate::services::artifacts::ArtifactPipeline;
use crate::services::chunk::chunk_sentences;
use crate::services::dictionary::apply_dictionary;
use crate::services::engine::{SynthesisEngine, SynthesisParams};
use crate::services::segment::segment_speakers;
use crate::utils::audio;

/// Between chunks the worker re-reads job status from the store; a paused job
/// is re-polled at this interval until it resumes, is cancelled, or vanishes.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of a control-plane poll before each chunk.
enum Control {
    Continue,
    /// Job cancelled or deleted; stop without touching the records further.
    Stop,
}

/// Processes single chapters of a job: normalize, segment, chunk, synthesize
/// sequentially under pause/cancel control, post-process, encode, persist,
/// and run fan-in via the store's atomic completed-chapter counter.
pub struct ChapterWorker {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn SynthesisEngine>,
    artifacts: Arc<ArtifactPipeline>,
    config: Config,
    name: String,
}

impl ChapterWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: Arc<dyn SynthesisEngine>,
        artifacts: Arc<ArtifactPipeline>,
        config: Config,
        name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            engine,
            artifacts,
            config,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Chapter-worker error boundary: any failure inside marks the job and
    /// this chapter `failed`; other chapters already dispatched keep running.
    pub async fn process_chapter(&self, job_id: &str, chapter_index: u32) {
        if let Err(e) = self.try_process(job_id, chapter_index).await {
            error!("Job {job_id} chapter {chapter_index} failed: {e:#}");
            let _ = self
                .store
                .update_job(
                    job_id,
                    JobUpdate::default()
                        .status(JobStatus::Failed)
                        .error(format!("{e:#}")),
                )
                .await;
            // Skip the chapter row when the job record is gone so a deleted
            // job is not partially resurrected.
            if let Ok(Some(_)) = self.store.get_job(job_id).await {
                let _ = self
                    .store
                    .upsert_chapter_state(
                        job_id,
                        chapter_index,
                        &self.name,
                        0,
                        0,
                        ChapterStatus::Failed,
                    )
                    .await;
            }
        }
    }

    async fn try_process(&self, job_id: &str, chapter_index: u32) -> Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        // Redelivered task for a chapter that already finished: skip without
        // touching the records again.
        let already_done = self
            .store
            .chapter_states(job_id)
            .await?
            .iter()
            .any(|c| c.chapter_index == chapter_index && c.status == ChapterStatus::Completed);
        if already_done {
            info!("Job {job_id} chapter {chapter_index} already completed, skipping");
            return Ok(());
        }

        // Claim the chapter. Only a queued job moves to `processing` here so
        // a concurrent pause is not overwritten.
        let mut claim = JobUpdate::default()
            .started_now()
            .worker_name(&self.name)
            .current_chapter(chapter_index + 1);
        if job.status == JobStatus::Queued {
            claim = claim.status(JobStatus::Processing);
        }
        self.store.update_job(job_id, claim).await?;

        let Some(chapter_text) = job.chapter_text(chapter_index as usize) else {
            bail!(
                "Chapter index {} out of range ({} chapters)",
                chapter_index,
                job.total_chapters
            );
        };

        let dictionary = self.store.dictionary().await?;
        let chapter_text = apply_dictionary(&dictionary, chapter_text);

        if matches!(self.poll_control(job_id).await?, Control::Stop) {
            return Ok(());
        }

        // Ordered (speaker, chunk) list for the whole chapter.
        let chunk_size = self.config.generation.chunk_size;
        let chunks: Vec<(String, String)> = segment_speakers(&chapter_text)
            .into_iter()
            .flat_map(|run| {
                chunk_sentences(&run.text, chunk_size)
                    .map(move |chunk| (run.speaker.clone(), chunk))
                    .collect::<Vec<_>>()
            })
            .collect();

        let total_chunks = chunks.len() as u32;
        if total_chunks == 0 {
            info!("Job {job_id} chapter {chapter_index}: empty chapter, nothing to synthesize");
            return Ok(());
        }

        self.store
            .update_job(
                job_id,
                JobUpdate::default()
                    .total_chunks(total_chunks)
                    .current_chunk(0),
            )
            .await?;
        self.store
            .upsert_chapter_state(
                job_id,
                chapter_index,
                &self.name,
                0,
                total_chunks,
                ChapterStatus::Processing,
            )
            .await?;

        let mut parts: Vec<Vec<f32>> = Vec::new();
        let mut sample_rate = self.config.generation.sample_rate;
        let pause_ms = self.config.generation.sentence_pause_ms;
        let test_mode = job.pipeline_mode == PipelineMode::TestPipeline;

        for (i, (speaker, chunk_text)) in chunks.iter().enumerate() {
            if matches!(self.poll_control(job_id).await?, Control::Stop) {
                return Ok(());
            }

            self.store
                .update_job(job_id, JobUpdate::default().current_chunk(i as u32 + 1))
                .await?;
            self.store
                .upsert_chapter_state(
                    job_id,
                    chapter_index,
                    &self.name,
                    i as u32 + 1,
                    total_chunks,
                    ChapterStatus::Processing,
                )
                .await?;

            let (prompt_path, lang_code) = self.resolve_voice(&job, speaker);
            let params = SynthesisParams::from_config(&self.config, lang_code.as_deref());

            let Some(synth) = self
                .engine
                .synthesize(chunk_text, prompt_path.as_deref(), &params)
                .await?
            else {
                // Engine produced nothing for this chunk; skip it.
                continue;
            };

            if synth.sample_rate > 0 {
                sample_rate = synth.sample_rate;
            }
            let mut samples = synth.samples;

            let speed = self.config.generation.speed_factor;
            if speed != 1.0 && speed > 0.0 {
                samples = audio::time_stretch(&samples, speed);
            }

            if job.pipeline_mode.wants_artifacts() {
                samples = self
                    .artifacts
                    .apply(samples, sample_rate, chunk_text, test_mode)
                    .await;
            }

            parts.push(samples);
            if pause_ms > 0 {
                parts.push(audio::silence(pause_ms, sample_rate));
            }
        }

        // A cancel that landed while the last chunk's synthesis was in flight
        // has not been observed yet; re-check before anything is persisted so
        // the buffered audio is discarded and the job stays cancelled.
        if matches!(self.poll_control(job_id).await?, Control::Stop) {
            return Ok(());
        }

        // Individual chunks may yield nothing, but a chapter with chunks and
        // no audio at all is a failure.
        if parts.is_empty() {
            bail!("Chapter {} produced no audio", chapter_index);
        }

        let full = audio::concat(&parts);
        let bytes = audio::encode(
            &full,
            sample_rate,
            job.output_format,
            job.output_bitrate_kbps,
        );
        let ext = job.output_format.ext();

        if test_mode {
            return self
                .finish_test_pipeline(job_id, chapter_index, total_chunks, &bytes, ext)
                .await;
        }

        let job_dir = self.config.job_output_dir(job_id);
        tokio::fs::create_dir_all(&job_dir).await?;
        let output_path = job_dir.join(format!("{}.{ext}", chapter_index + 1));
        tokio::fs::write(&output_path, &bytes)
            .await
            .with_context(|| format!("Failed to write {:?}", output_path))?;

        // Atomic, idempotent fan-in: exactly one fresh increment reaches the
        // chapter total and that worker finalizes the job.
        let Some(completion) = self
            .store
            .complete_chapter(job_id, chapter_index, &self.name, total_chunks)
            .await?
        else {
            return Ok(());
        };
        info!(
            "Job {job_id} chapter {chapter_index} completed ({}/{})",
            completion.completed_chapters, job.total_chapters
        );

        if completion.fresh && completion.completed_chapters >= job.total_chapters {
            let output_files: Vec<String> = (1..=job.total_chapters)
                .map(|n| format!("/outputs/{job_id}/{n}.{ext}"))
                .collect();
            self.store
                .update_job(
                    job_id,
                    JobUpdate::default()
                        .output_files(output_files)
                        .status(JobStatus::Completed)
                        .progress(100)
                        .completed_now(),
                )
                .await?;
            info!("Job {job_id} finalized by worker {}", self.name);
        }
        Ok(())
    }

    /// `test_pipeline` jobs write a single timestamped file to the test
    /// output directory and complete immediately.
    async fn finish_test_pipeline(
        &self,
        job_id: &str,
        chapter_index: u32,
        total_chunks: u32,
        bytes: &[u8],
        ext: &str,
    ) -> Result<()> {
        let test_dir = PathBuf::from(&self.config.test_output_folder);
        tokio::fs::create_dir_all(&test_dir).await?;
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let short_id: String = job_id.chars().take(8).collect();
        let filename = format!("test_{stamp}_{short_id}.{ext}");
        tokio::fs::write(test_dir.join(&filename), bytes).await?;

        self.store
            .upsert_chapter_state(
                job_id,
                chapter_index,
                &self.name,
                total_chunks,
                total_chunks,
                ChapterStatus::Completed,
            )
            .await?;
        self.store
            .update_job(
                job_id,
                JobUpdate::default()
                    .output_files(vec![format!("/test_outputs/{filename}")])
                    .status(JobStatus::Completed)
                    .progress(100)
                    .completed_now(),
            )
            .await?;
        Ok(())
    }

    /// Re-reads job status from the store. Blocks while paused (bounded poll,
    /// not a busy spin); reports `Stop` on cancellation or a vanished job.
    /// No status is cached across chunks.
    async fn poll_control(&self, job_id: &str) -> Result<Control> {
        loop {
            let Some(job) = self.store.get_job(job_id).await? else {
                return Ok(Control::Stop);
            };
            match job.status {
                JobStatus::Cancelled => return Ok(Control::Stop),
                JobStatus::Paused => tokio::time::sleep(PAUSE_POLL_INTERVAL).await,
                _ => return Ok(Control::Continue),
            }
        }
    }

    /// Voice resolution: explicit per-speaker assignment, then the explicit
    /// `default` assignment, then the global default voice. The result only
    /// becomes a reference prompt if the named file exists.
    fn resolve_voice(&self, job: &Job, speaker: &str) -> (Option<PathBuf>, Option<String>) {
        let assignment = job.voice_assignments.get(speaker);
        let lang_code = assignment.and_then(|a| a.lang_code.clone());

        let prompt = assignment
            .and_then(|a| a.audio_prompt_path.clone())
            .or_else(|| {
                job.voice_assignments
                    .get("default")
                    .and_then(|a| a.audio_prompt_path.clone())
            })
            .or_else(|| self.config.generation.default_voice.clone());

        let prompt_path = prompt.and_then(|name| {
            let candidate = PathBuf::from(&self.config.reference_audio_folder).join(name);
            candidate.exists().then_some(candidate)
        });
        (prompt_path, lang_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ArtifactsConfig;
    use crate::core::job::{OutputFormat, VoiceAssignment};
    use crate::core::store::JsonStore;
    use crate::services::engine::Synthesis;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;

    struct MockEngine {
        fail: bool,
        produce_none: bool,
        prompts_seen: Mutex<Vec<Option<String>>>,
    }

    impl MockEngine {
        fn ok() -> Self {
            Self {
                fail: false,
                produce_none: false,
                prompts_seen: Mutex::new(Vec::new()),
            }
        }
        fn failing() -> Self {
            Self {
                fail: true,
                produce_none: false,
                prompts_seen: Mutex::new(Vec::new()),
            }
        }
        fn silent() -> Self {
            Self {
                fail: false,
                produce_none: true,
                prompts_seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SynthesisEngine for MockEngine {
        async fn synthesize(
            &self,
            _text: &str,
            prompt_path: Option<&Path>,
            _params: &SynthesisParams,
        ) -> Result<Option<Synthesis>> {
            self.prompts_seen
                .lock()
                .unwrap()
                .push(prompt_path.map(|p| p.to_string_lossy().to_string()));
            if self.fail {
                return Err(anyhow!("Mock synthesis error"));
            }
            if self.produce_none {
                return Ok(None);
            }
            Ok(Some(Synthesis {
                samples: vec![0.1; 240],
                sample_rate: 24000,
            }))
        }
    }

    fn test_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.data_folder = root.join("data").to_string_lossy().to_string();
        config.output_folder = root.join("outputs").to_string_lossy().to_string();
        config.test_output_folder = root.join("test_outputs").to_string_lossy().to_string();
        config.reference_audio_folder = root.join("refs").to_string_lossy().to_string();
        config.generation.sentence_pause_ms = 0;
        config
    }

    fn make_job(job_id: &str, chapters: Vec<String>) -> Job {
        let total = chapters.len().max(1) as u32;
        Job {
            job_id: job_id.to_string(),
            title: "Test".to_string(),
            text: "Fallback text.".to_string(),
            chapters,
            voice_assignments: HashMap::new(),
            output_format: OutputFormat::Wav,
            output_bitrate_kbps: 128,
            pipeline_mode: PipelineMode::Baseline,
            status: JobStatus::Queued,
            progress: 0,
            current_chunk: 0,
            total_chunks: 0,
            current_chapter: 0,
            total_chapters: total,
            completed_chapters: 0,
            output_files: vec![],
            error: None,
            worker_name: None,
            created_at: Utc::now().to_rfc3339(),
            started_at: None,
            completed_at: None,
        }
    }

    fn worker_with(
        store: Arc<dyn JobStore>,
        engine: Arc<dyn SynthesisEngine>,
        config: Config,
        name: &str,
    ) -> ChapterWorker {
        let artifacts = Arc::new(ArtifactPipeline::new(ArtifactsConfig::default(), None, None));
        ChapterWorker::new(store, engine, artifacts, config, name)
    }

    #[tokio::test]
    async fn test_single_chapter_job_completes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        store
            .create_job(make_job("j1", vec!["One sentence. And two.".into()]))
            .await?;

        let worker = worker_with(store.clone(), Arc::new(MockEngine::ok()), config.clone(), "w1");
        worker.process_chapter("j1", 0).await;

        let job = store.get_job("j1").await?.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.completed_chapters, 1);
        assert_eq!(job.output_files, vec!["/outputs/j1/1.wav".to_string()]);
        assert!(job.completed_at.is_some());

        let path = config.job_output_dir("j1").join("1.wav");
        assert!(path.exists());

        let states = store.chapter_states("j1").await?;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].status, ChapterStatus::Completed);
        assert_eq!(states[0].worker_name, "w1");
        Ok(())
    }

    #[tokio::test]
    async fn test_untitled_text_fallback_chapter() -> Result<()> {
        // Empty chapter list: the whole job text is chapter 0.
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        store.create_job(make_job("j1", vec![])).await?;

        let worker = worker_with(store.clone(), Arc::new(MockEngine::ok()), config, "w1");
        worker.process_chapter("j1", 0).await;

        let job = store.get_job("j1").await?.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_engine_failure_marks_job_failed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        store
            .create_job(make_job("j1", vec!["Some text.".into()]))
            .await?;

        let worker = worker_with(store.clone(), Arc::new(MockEngine::failing()), config, "w1");
        worker.process_chapter("j1", 0).await;

        let job = store.get_job("j1").await?.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap_or("").contains("Mock synthesis error"));

        let states = store.chapter_states("j1").await?;
        assert_eq!(states[0].status, ChapterStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_chapter_with_no_audio_at_all_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        store
            .create_job(make_job("j1", vec!["Some text.".into()]))
            .await?;

        let worker = worker_with(store.clone(), Arc::new(MockEngine::silent()), config.clone(), "w1");
        worker.process_chapter("j1", 0).await;

        // Every chunk yielded nothing: no output file, chapter and job failed.
        let job = store.get_job("j1").await?.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap_or("").contains("no audio"));
        assert_eq!(job.completed_chapters, 0);
        assert!(!config.job_output_dir("j1").join("1.wav").exists());

        let states = store.chapter_states("j1").await?;
        assert_eq!(states[0].status, ChapterStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_job_exits_cleanly() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        let worker = worker_with(store.clone(), Arc::new(MockEngine::ok()), config, "w1");
        // Must not create any record for the unknown job.
        worker.process_chapter("ghost", 0).await;
        assert!(store.get_job("ghost").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_job_deleted_mid_run_exits_cleanly() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        store
            .create_job(make_job("j1", vec!["First one. Second one. Third one.".into()]))
            .await?;

        // Deletes the job from the outside during the first synthesis call.
        struct DeletingEngine {
            store: Arc<dyn JobStore>,
        }
        #[async_trait]
        impl SynthesisEngine for DeletingEngine {
            async fn synthesize(
                &self,
                _text: &str,
                _prompt_path: Option<&Path>,
                _params: &SynthesisParams,
            ) -> Result<Option<Synthesis>> {
                self.store.delete_job("j1").await?;
                Ok(Some(Synthesis {
                    samples: vec![0.1; 64],
                    sample_rate: 24000,
                }))
            }
        }

        let mut config = config;
        config.generation.chunk_size = 12;
        let engine = Arc::new(DeletingEngine {
            store: store.clone(),
        });
        let worker = worker_with(store.clone(), engine, config.clone(), "w1");
        worker.process_chapter("j1", 0).await;

        // Nothing written, nothing resurrected.
        assert!(store.get_job("j1").await?.is_none());
        assert!(store.chapter_states("j1").await?.is_empty());
        assert!(!config.job_output_dir("j1").join("1.wav").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_job_never_completes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        let mut job = make_job("j1", vec!["A. B. C.".into()]);
        job.status = JobStatus::Cancelled;
        store.create_job(job).await?;

        let worker = worker_with(store.clone(), Arc::new(MockEngine::ok()), config.clone(), "w1");
        worker.process_chapter("j1", 0).await;

        let job = store.get_job("j1").await?.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.completed_chapters, 0);
        assert!(!config.job_output_dir("j1").join("1.wav").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_mid_chapter_discards_remaining_work() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        // Three sentences, chunk limit small enough for three chunks.
        let mut job = make_job("j1", vec!["First one. Second one. Third one.".into()]);
        job.status = JobStatus::Processing;
        store.create_job(job).await?;

        // Cancels the job from the outside during the first synthesis call.
        struct CancellingEngine {
            store: Arc<dyn JobStore>,
        }
        #[async_trait]
        impl SynthesisEngine for CancellingEngine {
            async fn synthesize(
                &self,
                _text: &str,
                _prompt_path: Option<&Path>,
                _params: &SynthesisParams,
            ) -> Result<Option<Synthesis>> {
                self.store
                    .update_job("j1", JobUpdate::default().status(JobStatus::Cancelled))
                    .await?;
                Ok(Some(Synthesis {
                    samples: vec![0.1; 64],
                    sample_rate: 24000,
                }))
            }
        }

        let mut config = config;
        config.generation.chunk_size = 12;
        let engine = Arc::new(CancellingEngine {
            store: store.clone(),
        });
        let worker = worker_with(store.clone(), engine, config.clone(), "w1");
        worker.process_chapter("j1", 0).await;

        let job = store.get_job("j1").await?.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.completed_chapters, 0);
        assert!(job.output_files.is_empty());
        assert!(!config.job_output_dir("j1").join("1.wav").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_during_final_chunk_discards_buffered_audio() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        // Single-chunk chapter: the cancel lands while the only (and thus
        // final) synthesis call is in flight, after the last pre-chunk poll.
        let mut job = make_job("j1", vec!["Only sentence.".into()]);
        job.status = JobStatus::Processing;
        store.create_job(job).await?;

        struct CancellingEngine {
            store: Arc<dyn JobStore>,
        }
        #[async_trait]
        impl SynthesisEngine for CancellingEngine {
            async fn synthesize(
                &self,
                _text: &str,
                _prompt_path: Option<&Path>,
                _params: &SynthesisParams,
            ) -> Result<Option<Synthesis>> {
                self.store
                    .update_job("j1", JobUpdate::default().status(JobStatus::Cancelled))
                    .await?;
                Ok(Some(Synthesis {
                    samples: vec![0.1; 64],
                    sample_rate: 24000,
                }))
            }
        }

        let engine = Arc::new(CancellingEngine {
            store: store.clone(),
        });
        let worker = worker_with(store.clone(), engine, config.clone(), "w1");
        worker.process_chapter("j1", 0).await;

        let job = store.get_job("j1").await?.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.completed_chapters, 0);
        assert!(job.output_files.is_empty());
        assert!(!config.job_output_dir("j1").join("1.wav").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_after_job_deletion_leaves_no_orphan_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        store
            .create_job(make_job("j1", vec!["Some text.".into()]))
            .await?;

        // Deletes the job and then fails, so the error boundary runs against
        // a vanished record.
        struct DeletingFailingEngine {
            store: Arc<dyn JobStore>,
        }
        #[async_trait]
        impl SynthesisEngine for DeletingFailingEngine {
            async fn synthesize(
                &self,
                _text: &str,
                _prompt_path: Option<&Path>,
                _params: &SynthesisParams,
            ) -> Result<Option<Synthesis>> {
                self.store.delete_job("j1").await?;
                Err(anyhow!("model crashed"))
            }
        }

        let engine = Arc::new(DeletingFailingEngine {
            store: store.clone(),
        });
        let worker = worker_with(store.clone(), engine, config, "w1");
        worker.process_chapter("j1", 0).await;

        assert!(store.get_job("j1").await?.is_none());
        assert!(store.chapter_states("j1").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_paused_job_blocks_until_resume() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        let mut job = make_job("j1", vec!["Hello there.".into()]);
        job.status = JobStatus::Paused;
        store.create_job(job).await?;

        let worker = Arc::new(worker_with(
            store.clone(),
            Arc::new(MockEngine::ok()),
            config,
            "w1",
        ));
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.process_chapter("j1", 0).await })
        };

        // Still paused after a moment; then resume and let it finish.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());
        store
            .update_job("j1", JobUpdate::default().status(JobStatus::Processing))
            .await?;
        tokio::time::timeout(Duration::from_secs(10), handle).await??;

        let job = store.get_job("j1").await?.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_voice_resolution_prefers_speaker_then_default() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.reference_audio_folder)?;
        std::fs::write(
            Path::new(&config.reference_audio_folder).join("anna.wav"),
            b"ref",
        )?;
        std::fs::write(
            Path::new(&config.reference_audio_folder).join("narrator.wav"),
            b"ref",
        )?;

        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        let mut job = make_job("j1", vec!["[Anna]Hi there.[/Anna] And more text.".into()]);
        job.voice_assignments.insert(
            "Anna".to_string(),
            VoiceAssignment {
                audio_prompt_path: Some("anna.wav".to_string()),
                lang_code: Some("en".to_string()),
            },
        );
        job.voice_assignments.insert(
            "default".to_string(),
            VoiceAssignment {
                audio_prompt_path: Some("narrator.wav".to_string()),
                lang_code: None,
            },
        );
        store.create_job(job).await?;

        let engine = Arc::new(MockEngine::ok());
        let worker = worker_with(store.clone(), engine.clone(), config, "w1");
        worker.process_chapter("j1", 0).await;

        let prompts = engine.prompts_seen.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].as_deref().unwrap().ends_with("anna.wav"));
        assert!(prompts[1].as_deref().unwrap().ends_with("narrator.wav"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_reference_file_means_no_prompt() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        let mut job = make_job("j1", vec!["Hello.".into()]);
        job.voice_assignments.insert(
            "default".to_string(),
            VoiceAssignment {
                audio_prompt_path: Some("nonexistent.wav".to_string()),
                lang_code: None,
            },
        );
        store.create_job(job).await?;

        let engine = Arc::new(MockEngine::ok());
        let worker = worker_with(store.clone(), engine.clone(), config, "w1");
        worker.process_chapter("j1", 0).await;

        let prompts = engine.prompts_seen.lock().unwrap();
        assert_eq!(prompts.as_slice(), &[None]);
        Ok(())
    }

    #[tokio::test]
    async fn test_test_pipeline_writes_timestamped_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        let mut job = make_job("j1", vec!["Test me.".into()]);
        job.pipeline_mode = PipelineMode::TestPipeline;
        store.create_job(job).await?;

        let worker = worker_with(store.clone(), Arc::new(MockEngine::ok()), config.clone(), "w1");
        worker.process_chapter("j1", 0).await;

        let job = store.get_job("j1").await?.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output_files.len(), 1);
        assert!(job.output_files[0].starts_with("/test_outputs/test_"));

        let entries: Vec<_> = std::fs::read_dir(&config.test_output_folder)?
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
        // Regular per-job output dir stays empty in test mode.
        assert!(!config.job_output_dir("j1").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_dictionary_applied_before_synthesis() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        store.set_word("dr", "doktor").await?;
        store
            .create_job(make_job("j1", vec!["dr Kowalski przyszedł.".into()]))
            .await?;

        struct CapturingEngine(Mutex<Vec<String>>);
        #[async_trait]
        impl SynthesisEngine for CapturingEngine {
            async fn synthesize(
                &self,
                text: &str,
                _prompt_path: Option<&Path>,
                _params: &SynthesisParams,
            ) -> Result<Option<Synthesis>> {
                self.0.lock().unwrap().push(text.to_string());
                Ok(Some(Synthesis {
                    samples: vec![0.0; 8],
                    sample_rate: 24000,
                }))
            }
        }

        let engine = Arc::new(CapturingEngine(Mutex::new(Vec::new())));
        let worker = worker_with(store.clone(), engine.clone(), config, "w1");
        worker.process_chapter("j1", 0).await;

        let texts = engine.0.lock().unwrap();
        assert_eq!(texts.as_slice(), &["doktor Kowalski przyszedł."]);
        Ok(())
    }

    #[tokio::test]
    async fn test_redelivered_completed_chapter_does_not_refinalize() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = test_config(dir.path());
        let store: Arc<dyn JobStore> = Arc::new(JsonStore::new(&config.data_folder));
        store
            .create_job(make_job("j1", vec!["Only chapter.".into()]))
            .await?;

        let worker = worker_with(store.clone(), Arc::new(MockEngine::ok()), config, "w1");
        worker.process_chapter("j1", 0).await;
        let first = store.get_job("j1").await?.unwrap();
        assert_eq!(first.completed_chapters, 1);
        let completed_at = first.completed_at.clone();

        // At-least-once delivery: the same task arrives again.
        worker.process_chapter("j1", 0).await;
        let second = store.get_job("j1").await?.unwrap();
        assert_eq!(second.completed_chapters, 1);
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(second.completed_at, completed_at);
        Ok(())
    }
}
