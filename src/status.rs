//! Aggregate progress for polling.
//!
//! Everything here is a pure function of the stored job. Nothing reads the
//! clock, so polling an unchanged job yields an identical snapshot, and
//! because item states never leave a terminal state, `percent_complete`
//! never goes down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::job::{ItemState, ItemTask, Job, JobId, JobStatus};
use crate::pipeline::{GeneratorType, round_usd};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub processing: usize,
    /// Items still waiting for a worker.
    pub pending: usize,
    pub percent_complete: f64,
    /// `None` until at least one item has completed.
    pub estimated_time_remaining_ms: Option<u64>,
}

/// Failure summary exposed per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFailure {
    pub kind: FailureKind,
    pub message: String,
    pub stage_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSnapshot {
    pub index: usize,
    pub topic: String,
    pub state: ItemState,
    pub stage_index: usize,
    pub attempts: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub word_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemFailure>,
}

impl From<&ItemTask> for ItemSnapshot {
    fn from(item: &ItemTask) -> Self {
        let result = item.result();
        Self {
            index: item.index(),
            topic: item.input().topic.clone(),
            state: item.state(),
            stage_index: item.stage_index(),
            attempts: item.attempts().to_vec(),
            content_ref: result.and_then(|r| r.content_ref.clone()),
            word_count: result.map(|r| r.word_count),
            cost_usd: match item.state() {
                ItemState::Completed | ItemState::Failed => Some(item.cost_usd()),
                _ => None,
            },
            error: item.error().map(|e| ItemFailure {
                kind: e.kind,
                message: e.message.clone(),
                stage_index: e.stage_index,
            }),
        }
    }
}

/// What a poll returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusSnapshot {
    pub job_id: JobId,
    pub organization_id: String,
    pub generator_type: GeneratorType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub cancel_requested: bool,
    pub progress: Progress,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub items: Vec<ItemSnapshot>,
}

pub struct StatusReporter;

impl StatusReporter {
    pub fn compute_progress(job: &Job) -> Progress {
        let items = job.items();
        let count = |state: ItemState| items.iter().filter(|i| i.state() == state).count();

        let total = items.len();
        let completed = count(ItemState::Completed);
        let failed = count(ItemState::Failed);
        let cancelled = count(ItemState::Cancelled);
        let processing = count(ItemState::Processing);
        let pending = count(ItemState::Queued);

        let percent_complete = if total == 0 {
            0.0
        } else {
            let pct = (completed + failed + cancelled) as f64 / total as f64 * 100.0;
            (pct * 100.0).round() / 100.0
        };

        let durations: Vec<u64> = items
            .iter()
            .filter_map(|i| i.result().map(|r| r.duration_ms))
            .collect();
        let estimated_time_remaining_ms = if durations.is_empty() {
            None
        } else {
            let avg = durations.iter().sum::<u64>() / durations.len() as u64;
            Some(avg * (pending + processing) as u64)
        };

        Progress {
            total,
            completed,
            failed,
            cancelled,
            processing,
            pending,
            percent_complete,
            estimated_time_remaining_ms,
        }
    }

    pub fn snapshot(job: &Job) -> JobStatusSnapshot {
        let items = job.items();
        JobStatusSnapshot {
            job_id: job.id.clone(),
            organization_id: job.organization_id.clone(),
            generator_type: job.generator_type,
            status: job.status(),
            created_at: job.created_at,
            cancel_requested: job.cancel_requested,
            progress: Self::compute_progress(job),
            total_cost_usd: round_usd(items.iter().map(ItemTask::cost_usd).sum()),
            total_tokens: items.iter().map(|i| i.tokens().total()).sum(),
            items: items.iter().map(ItemSnapshot::from).collect(),
        }
    }
}
