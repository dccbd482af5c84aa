use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ContentStore, JobStore, apply_item_update, slugify};
use crate::error::StoreError;
use crate::job::{ItemTask, Job, JobId};

/// Job ids become file names, so only plain identifier characters are accepted.
fn is_safe_id(id: &JobId) -> bool {
    !id.as_str().is_empty()
        && id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// One JSON document per job under a directory.
///
/// Writes are serialized through one lock and land via write-then-rename,
/// so a reader never sees a half-written job.
pub struct FileJobStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileJobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &JobId) -> Result<PathBuf, StoreError> {
        if !is_safe_id(id) {
            return Err(StoreError::JobNotFound(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn read(&self, path: &Path) -> Result<Option<Job>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &Path, job: &Job) -> Result<(), StoreError> {
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.path_for(&job.id)?;
        let _guard = self.write_lock.lock().await;
        self.write(&path, job).await
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        if !is_safe_id(id) {
            return Ok(None);
        }
        let path = self.path_for(id)?;
        self.read(&path).await
    }

    async fn update_item(&self, id: &JobId, item: &ItemTask) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock().await;
        let mut job = self
            .read(&path)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        apply_item_update(&mut job, item)?;
        self.write(&path, &job).await
    }

    async fn mark_cancel_requested(&self, id: &JobId) -> Result<(), StoreError> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock().await;
        let mut job = self
            .read(&path)
            .await?
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        job.cancel_requested = true;
        self.write(&path, &job).await
    }
}

/// Writes each finished article to `<dir>/<job_id>/<index>-<slug>.md`.
pub struct FileContentStore {
    dir: PathBuf,
}

impl FileContentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ContentStore for FileContentStore {
    async fn persist(
        &self,
        job_id: &JobId,
        item_index: usize,
        topic: &str,
        content: &str,
    ) -> Result<String, StoreError> {
        let job_dir = self.dir.join(job_id.as_str());
        tokio::fs::create_dir_all(&job_dir).await?;
        let path = job_dir.join(format!("{item_index:02}-{}.md", slugify(topic)));
        tokio::fs::write(&path, content).await?;
        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ItemInput, ItemState, JobSettings, SubmitRequest};
    use crate::pipeline::{GeneratorType, StageOutput, TokenUsage};

    fn job(n: usize) -> Job {
        Job::new(
            SubmitRequest {
                generator_type: GeneratorType::SingleAgent,
                organization_id: "org".into(),
                items: (0..n)
                    .map(|i| ItemInput {
                        topic: format!("Topic {i}"),
                        category: String::new(),
                        target_word_count: 10,
                        keywords: vec![],
                    })
                    .collect(),
                settings: JobSettings::default(),
            },
            1,
        )
    }

    #[tokio::test]
    async fn job_survives_reopening_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(2);
        {
            let store = FileJobStore::open(dir.path()).await.unwrap();
            store.put(&job).await.unwrap();

            let mut item = job.items()[1].clone();
            item.start().unwrap();
            item.record_success(StageOutput {
                output: "done".into(),
                tokens_used: TokenUsage::new(1, 1),
                cost_usd: 0.01,
            })
            .unwrap();
            item.complete(None).unwrap();
            store.update_item(&job.id, &item).await.unwrap();
            store.mark_cancel_requested(&job.id).await.unwrap();
        }

        let reopened = FileJobStore::open(dir.path()).await.unwrap();
        let stored = reopened.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.items()[0].state(), ItemState::Queued);
        assert_eq!(stored.items()[1].state(), ItemState::Completed);
        assert!(stored.cancel_requested);
    }

    #[tokio::test]
    async fn unsafe_ids_are_never_resolved_to_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        assert!(store.get(&JobId::from("../etc/passwd")).await.unwrap().is_none());
        assert!(store.get(&JobId::from("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn content_lands_in_job_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileContentStore::new(dir.path());
        let id = JobId::from("job-7");
        let path = store.persist(&id, 4, "Why Rust?", "# Why Rust").await.unwrap();
        assert!(path.ends_with("04-why-rust.md"));
        let written = std::fs::read_to_string(dir.path().join("job-7/04-why-rust.md")).unwrap();
        assert_eq!(written, "# Why Rust");
    }
}
