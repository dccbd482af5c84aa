//! Persistence seams used by the queue.
//!
//! The queue never holds global job state of its own: it reads and writes
//! jobs through a [`JobStore`], hands finished content to a
//! [`ContentStore`], and asks a [`LimitsService`] before spending money.

mod file;
mod limits;
mod memory;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::job::{ItemTask, Job, JobId};

pub use file::{FileContentStore, FileJobStore};
pub use limits::{InMemoryLimits, LimitsService, Quota};
pub use memory::{InMemoryContentStore, InMemoryJobStore};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a newly submitted job.
    async fn put(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Replace one item slot. Fails with [`StoreError::TerminalItem`] if the
    /// stored item is already terminal, so a finished item is written once.
    async fn update_item(&self, id: &JobId, item: &ItemTask) -> Result<(), StoreError>;

    async fn mark_cancel_requested(&self, id: &JobId) -> Result<(), StoreError>;
}

/// Where finished content goes. Returns an identifier for later retrieval.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn persist(
        &self,
        job_id: &JobId,
        item_index: usize,
        topic: &str,
        content: &str,
    ) -> Result<String, StoreError>;
}

/// Apply an item update to a job in place, enforcing the write-once rule.
pub(crate) fn apply_item_update(job: &mut Job, item: &ItemTask) -> Result<(), StoreError> {
    let job_id = job.id.to_string();
    let slot = job
        .item_mut(item.index())
        .ok_or_else(|| StoreError::ItemOutOfRange {
            job_id: job_id.clone(),
            index: item.index(),
        })?;
    if slot.state().is_terminal() {
        return Err(StoreError::TerminalItem {
            job_id,
            index: item.index(),
        });
    }
    *slot = item.clone();
    Ok(())
}

/// Lowercase, dash-separated form of a topic for file names.
pub(crate) fn slugify(topic: &str) -> String {
    let mut slug = String::with_capacity(topic.len());
    let mut dash = false;
    for c in topic.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    slug.truncate(60);
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("item");
    }
    slug
}
