use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ContentStore, JobStore, apply_item_update, slugify};
use crate::error::StoreError;
use crate::job::{ItemTask, Job, JobId};

/// Jobs held in a map behind a single lock.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().get(id).cloned())
    }

    async fn update_item(&self, id: &JobId, item: &ItemTask) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        apply_item_update(job, item)
    }

    async fn mark_cancel_requested(&self, id: &JobId) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        job.cancel_requested = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryContentStore {
    contents: RwLock<HashMap<String, String>>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, content_ref: &str) -> Option<String> {
        self.contents.read().get(content_ref).cloned()
    }

    pub fn len(&self) -> usize {
        self.contents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.read().is_empty()
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn persist(
        &self,
        job_id: &JobId,
        item_index: usize,
        topic: &str,
        content: &str,
    ) -> Result<String, StoreError> {
        let content_ref = format!("mem://{job_id}/{item_index}-{}", slugify(topic));
        self.contents
            .write()
            .insert(content_ref.clone(), content.to_string());
        Ok(content_ref)
    }
}
