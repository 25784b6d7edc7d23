use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::core::job::{ChapterState, ChapterStatus, Job, JobStatus};

/// Partial update of a job record. Each field left as `None` is untouched, so
/// a single call maps to one store round-trip.
#[derive(Debug, Default, Clone)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub current_chunk: Option<u32>,
    pub total_chunks: Option<u32>,
    pub current_chapter: Option<u32>,
    pub output_files: Option<Vec<String>>,
    pub error: Option<String>,
    pub worker_name: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub title: Option<String>,
}

impl JobUpdate {
    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }
    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }
    pub fn current_chunk(mut self, chunk: u32) -> Self {
        self.current_chunk = Some(chunk);
        self
    }
    pub fn total_chunks(mut self, total: u32) -> Self {
        self.total_chunks = Some(total);
        self
    }
    pub fn current_chapter(mut self, chapter: u32) -> Self {
        self.current_chapter = Some(chapter);
        self
    }
    pub fn output_files(mut self, files: Vec<String>) -> Self {
        self.output_files = Some(files);
        self
    }
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = Some(name.into());
        self
    }
    pub fn started_now(mut self) -> Self {
        self.started_at = Some(Utc::now().to_rfc3339());
        self
    }
    pub fn completed_now(mut self) -> Self {
        self.completed_at = Some(Utc::now().to_rfc3339());
        self
    }
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    fn apply(self, job: &mut Job) {
        if let Some(v) = self.status {
            job.status = v;
        }
        if let Some(v) = self.progress {
            job.progress = v;
        }
        if let Some(v) = self.current_chunk {
            job.current_chunk = v;
        }
        if let Some(v) = self.total_chunks {
            job.total_chunks = v;
        }
        if let Some(v) = self.current_chapter {
            job.current_chapter = v;
        }
        if let Some(v) = self.output_files {
            job.output_files = v;
        }
        if let Some(v) = self.error {
            job.error = Some(v);
        }
        if let Some(v) = self.worker_name {
            job.worker_name = Some(v);
        }
        if let Some(v) = self.started_at {
            job.started_at = Some(v);
        }
        if let Some(v) = self.completed_at {
            job.completed_at = Some(v);
        }
        if let Some(v) = self.title {
            job.title = v;
        }
    }
}

/// Result of the atomic fan-in step. `fresh` is false when the chapter was
/// already recorded completed, which happens on task redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChapterCompletion {
    pub completed_chapters: u32,
    pub fresh: bool,
}

/// Single source of truth for jobs, chapter progress and the user dictionary.
/// Workers hold no authoritative state of their own and re-read job status
/// through this trait between chunks.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: Job) -> Result<()>;
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>>;
    async fn active_job_count(&self) -> Result<usize>;
    /// No-op when the job no longer exists; workers notice deletion on their
    /// next `get_job` and stop.
    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<()>;
    async fn delete_job(&self, job_id: &str) -> Result<bool>;

    /// Marks the chapter completed and increments the job's completed-chapter
    /// counter in one atomic step. Idempotent per (job, chapter): a chapter
    /// already recorded as completed returns the current counter unchanged.
    /// `None` means the job record has vanished.
    async fn complete_chapter(
        &self,
        job_id: &str,
        chapter_index: u32,
        worker_name: &str,
        total_chunks: u32,
    ) -> Result<Option<ChapterCompletion>>;

    async fn upsert_chapter_state(
        &self,
        job_id: &str,
        chapter_index: u32,
        worker_name: &str,
        current_chunk: u32,
        total_chunks: u32,
        status: ChapterStatus,
    ) -> Result<()>;
    async fn chapter_states(&self, job_id: &str) -> Result<Vec<ChapterState>>;

    async fn dictionary(&self) -> Result<BTreeMap<String, String>>;
    async fn set_word(&self, word: &str, replacement: &str) -> Result<()>;
    async fn delete_word(&self, word: &str) -> Result<()>;
    async fn clear_dictionary(&self) -> Result<()>;
    async fn import_dictionary(&self, entries: BTreeMap<String, String>) -> Result<()>;
    async fn dictionary_len(&self) -> Result<usize>;
}

/// Durable store backed by JSON documents under a data directory:
/// `jobs/<id>.json`, `chapters/<id>.json`, `dictionary.json`.
///
/// All mutations run under one internal lock and land via temp-file + rename,
/// so `complete_chapter` is a true atomic read-modify-write for every worker
/// sharing this store handle. Multi-host deployments swap in a database-backed
/// `JobStore` instead.
pub struct JsonStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.root.join("jobs").join(format!("{job_id}.json"))
    }

    fn chapters_path(&self, job_id: &str) -> PathBuf {
        self.root.join("chapters").join(format!("{job_id}.json"))
    }

    fn dictionary_path(&self) -> PathBuf {
        self.root.join("dictionary.json")
    }

    async fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(None);
        }
        let bytes = tokio::fs::read(path).await?;
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt store document {:?}", path))?;
        Ok(Some(value))
    }

    async fn load_chapters(&self, job_id: &str) -> Result<Vec<ChapterState>> {
        Ok(self
            .read_json(&self.chapters_path(job_id))
            .await?
            .unwrap_or_default())
    }

    async fn load_dictionary(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .read_json(&self.dictionary_path())
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl JobStore for JsonStore {
    async fn create_job(&self, job: Job) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write_json(&self.job_path(&job.job_id), &job).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let _guard = self.lock.lock().await;
        self.read_json(&self.job_path(job_id)).await
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let _guard = self.lock.lock().await;
        let dir = self.root.join("jobs");
        let mut jobs: Vec<Job> = Vec::new();
        if tokio::fs::try_exists(&dir).await? {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().map(|e| e == "json") != Some(true) {
                    continue;
                }
                if let Some(job) = self.read_json::<Job>(&path).await? {
                    if status.map(|s| job.status == s).unwrap_or(true) {
                        jobs.push(job);
                    }
                }
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn active_job_count(&self) -> Result<usize> {
        let jobs = self.list_jobs(None).await?;
        Ok(jobs.iter().filter(|j| j.status.is_active()).count())
    }

    async fn update_job(&self, job_id: &str, update: JobUpdate) -> Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.job_path(job_id);
        let Some(mut job) = self.read_json::<Job>(&path).await? else {
            return Ok(());
        };
        update.apply(&mut job);
        self.write_json(&path, &job).await
    }

    async fn delete_job(&self, job_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let path = self.job_path(job_id);
        let existed = tokio::fs::try_exists(&path).await?;
        if existed {
            tokio::fs::remove_file(&path).await?;
        }
        let chapters = self.chapters_path(job_id);
        if tokio::fs::try_exists(&chapters).await? {
            tokio::fs::remove_file(&chapters).await?;
        }
        Ok(existed)
    }

    async fn complete_chapter(
        &self,
        job_id: &str,
        chapter_index: u32,
        worker_name: &str,
        total_chunks: u32,
    ) -> Result<Option<ChapterCompletion>> {
        let _guard = self.lock.lock().await;
        let job_path = self.job_path(job_id);
        let Some(mut job) = self.read_json::<Job>(&job_path).await? else {
            return Ok(None);
        };

        let mut chapters = self.load_chapters(job_id).await?;
        let now = Utc::now().to_rfc3339();
        let existing = chapters
            .iter_mut()
            .find(|c| c.chapter_index == chapter_index);

        match existing {
            Some(state) if state.status == ChapterStatus::Completed => {
                // Redelivered task: counter stays put.
                return Ok(Some(ChapterCompletion {
                    completed_chapters: job.completed_chapters,
                    fresh: false,
                }));
            }
            Some(state) => {
                state.status = ChapterStatus::Completed;
                state.worker_name = worker_name.to_string();
                state.current_chunk = total_chunks;
                state.total_chunks = total_chunks;
                state.updated_at = now;
            }
            None => chapters.push(ChapterState {
                job_id: job_id.to_string(),
                chapter_index,
                worker_name: worker_name.to_string(),
                current_chunk: total_chunks,
                total_chunks,
                status: ChapterStatus::Completed,
                updated_at: now,
            }),
        }

        self.write_json(&self.chapters_path(job_id), &chapters)
            .await?;
        job.completed_chapters += 1;
        let completed = job.completed_chapters;
        self.write_json(&job_path, &job).await?;
        Ok(Some(ChapterCompletion {
            completed_chapters: completed,
            fresh: true,
        }))
    }

    async fn upsert_chapter_state(
        &self,
        job_id: &str,
        chapter_index: u32,
        worker_name: &str,
        current_chunk: u32,
        total_chunks: u32,
        status: ChapterStatus,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut chapters = self.load_chapters(job_id).await?;
        let now = Utc::now().to_rfc3339();
        if let Some(state) = chapters
            .iter_mut()
            .find(|c| c.chapter_index == chapter_index)
        {
            state.worker_name = worker_name.to_string();
            state.current_chunk = current_chunk;
            state.total_chunks = total_chunks;
            state.status = status;
            state.updated_at = now;
        } else {
            chapters.push(ChapterState {
                job_id: job_id.to_string(),
                chapter_index,
                worker_name: worker_name.to_string(),
                current_chunk,
                total_chunks,
                status,
                updated_at: now,
            });
        }
        self.write_json(&self.chapters_path(job_id), &chapters)
            .await
    }

    async fn chapter_states(&self, job_id: &str) -> Result<Vec<ChapterState>> {
        let _guard = self.lock.lock().await;
        let mut chapters = self.load_chapters(job_id).await?;
        chapters.sort_by_key(|c| c.chapter_index);
        Ok(chapters)
    }

    async fn dictionary(&self) -> Result<BTreeMap<String, String>> {
        let _guard = self.lock.lock().await;
        self.load_dictionary().await
    }

    async fn set_word(&self, word: &str, replacement: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut dict = self.load_dictionary().await?;
        dict.insert(word.to_string(), replacement.to_string());
        self.write_json(&self.dictionary_path(), &dict).await
    }

    async fn delete_word(&self, word: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut dict = self.load_dictionary().await?;
        dict.remove(word);
        self.write_json(&self.dictionary_path(), &dict).await
    }

    async fn clear_dictionary(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write_json(&self.dictionary_path(), &BTreeMap::<String, String>::new())
            .await
    }

    async fn import_dictionary(&self, entries: BTreeMap<String, String>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut dict = self.load_dictionary().await?;
        dict.extend(entries);
        self.write_json(&self.dictionary_path(), &dict).await
    }

    async fn dictionary_len(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.load_dictionary().await?.len())
    }
}
