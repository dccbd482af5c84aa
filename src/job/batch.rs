use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::item::{ItemInput, ItemState, ItemTask};
use crate::error::{SubmitError, ValidationIssue};
use crate::pipeline::{GeneratorType, ModelTier};

/// Largest batch a single submission may carry.
pub const MAX_ITEMS_PER_JOB: usize = 50;

/// Opaque, unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Aggregate job status, always derived from the item states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Processing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Partial => write!(f, "partial"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Derive the job status from its item states.
///
/// A job is never `Failed` while any item can still succeed, and is
/// `Failed` only when every item failed.
pub fn derive_status<I>(states: I) -> JobStatus
where
    I: IntoIterator<Item = ItemState>,
{
    let (mut total, mut queued, mut completed, mut failed, mut cancelled) = (0, 0, 0, 0, 0);
    let mut open = false;
    for state in states {
        total += 1;
        match state {
            ItemState::Queued => {
                queued += 1;
                open = true;
            }
            ItemState::Processing => open = true,
            ItemState::Completed => completed += 1,
            ItemState::Failed => failed += 1,
            ItemState::Cancelled => cancelled += 1,
        }
    }

    if total == 0 || queued == total {
        JobStatus::Queued
    } else if open {
        JobStatus::Processing
    } else if completed == total {
        JobStatus::Completed
    } else if failed == total {
        JobStatus::Failed
    } else if cancelled == total {
        JobStatus::Cancelled
    } else {
        JobStatus::Partial
    }
}

/// Configuration shared by every item of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Bypasses each stage's default model tier when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<ModelTier>,
}

/// A batch submission as received from the outer layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub generator_type: GeneratorType,
    pub organization_id: String,
    pub items: Vec<ItemInput>,
    #[serde(default)]
    pub settings: JobSettings,
}

impl SubmitRequest {
    /// Check the whole request and report every problem at once.
    pub fn validate(&self, max_items: usize) -> Result<(), SubmitError> {
        let mut issues = Vec::new();
        if self.organization_id.trim().is_empty() {
            issues.push(ValidationIssue::request(
                "organizationId",
                "must not be empty",
            ));
        }
        if self.items.is_empty() || self.items.len() > max_items {
            issues.push(ValidationIssue::request(
                "items",
                format!(
                    "must contain 1 to {max_items} items, got {}",
                    self.items.len()
                ),
            ));
        }
        for (i, item) in self.items.iter().enumerate() {
            issues.extend(item.validate(i));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(SubmitError::Validation(issues))
        }
    }
}

/// One batch of topics and the item tasks generating them.
///
/// Item membership is fixed at construction; only each item's own state
/// changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub organization_id: String,
    pub generator_type: GeneratorType,
    pub settings: JobSettings,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cancel_requested: bool,
    items: Vec<ItemTask>,
}

impl Job {
    /// Build a job with every item `Queued`. The request must already be validated.
    pub fn new(request: SubmitRequest, stage_count: usize) -> Self {
        let items = request
            .items
            .into_iter()
            .enumerate()
            .map(|(i, input)| ItemTask::new(i, input, stage_count))
            .collect();
        Self {
            id: JobId::new(),
            organization_id: request.organization_id,
            generator_type: request.generator_type,
            settings: request.settings,
            created_at: Utc::now(),
            cancel_requested: false,
            items,
        }
    }

    pub fn items(&self) -> &[ItemTask] {
        &self.items
    }

    pub fn item(&self, index: usize) -> Option<&ItemTask> {
        self.items.get(index)
    }

    /// Mutable access to an existing slot; the store uses this to apply an
    /// item update without changing membership.
    pub(crate) fn item_mut(&mut self, index: usize) -> Option<&mut ItemTask> {
        self.items.get_mut(index)
    }

    pub fn status(&self) -> JobStatus {
        derive_status(self.items.iter().map(ItemTask::state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ItemState::*;

    fn item(topic: &str) -> ItemInput {
        ItemInput {
            topic: topic.into(),
            category: "news".into(),
            target_word_count: 300,
            keywords: vec!["seo".into()],
        }
    }

    fn request(n: usize) -> SubmitRequest {
        SubmitRequest {
            generator_type: GeneratorType::MultiAgent,
            organization_id: "org-1".into(),
            items: (0..n).map(|i| item(&format!("topic {i}"))).collect(),
            settings: JobSettings::default(),
        }
    }

    #[test]
    fn status_derivation_covers_every_case() {
        assert_eq!(derive_status([Queued, Queued]), JobStatus::Queued);
        assert_eq!(derive_status([Queued, Processing]), JobStatus::Processing);
        assert_eq!(derive_status([Queued, Completed]), JobStatus::Processing);
        assert_eq!(derive_status([Failed, Queued]), JobStatus::Processing);
        assert_eq!(derive_status([Completed, Completed]), JobStatus::Completed);
        assert_eq!(derive_status([Failed, Failed]), JobStatus::Failed);
        assert_eq!(derive_status([Completed, Failed]), JobStatus::Partial);
        assert_eq!(derive_status([Completed, Cancelled]), JobStatus::Partial);
        assert_eq!(derive_status([Failed, Cancelled]), JobStatus::Partial);
        assert_eq!(derive_status([Cancelled, Cancelled]), JobStatus::Cancelled);
    }

    #[test]
    fn job_is_not_failed_while_an_item_can_succeed() {
        assert_eq!(
            derive_status([Failed, Failed, Processing]),
            JobStatus::Processing
        );
    }

    #[test]
    fn new_job_has_every_item_queued() {
        let job = Job::new(request(3), 4);
        assert_eq!(job.items().len(), 3);
        assert!(job.items().iter().all(|i| i.state() == Queued));
        assert_eq!(job.items()[2].index(), 2);
        assert_eq!(job.items()[0].attempts(), &[0, 0, 0, 0]);
        assert_eq!(job.status(), JobStatus::Queued);
    }

    #[test]
    fn validate_accepts_one_to_fifty_items() {
        assert!(request(1).validate(MAX_ITEMS_PER_JOB).is_ok());
        assert!(request(50).validate(MAX_ITEMS_PER_JOB).is_ok());
    }

    #[test]
    fn validate_rejects_empty_and_oversized_batches() {
        for n in [0, 51] {
            match request(n).validate(MAX_ITEMS_PER_JOB) {
                Err(SubmitError::Validation(issues)) => {
                    assert_eq!(issues.len(), 1);
                    assert_eq!(issues[0].field, "items");
                }
                other => panic!("expected validation error for {n} items, got {other:?}"),
            }
        }
    }

    #[test]
    fn validate_collects_item_issues() {
        let mut req = request(3);
        req.items[1].topic = String::new();
        req.items[2].target_word_count = 0;
        req.organization_id = " ".into();
        match req.validate(MAX_ITEMS_PER_JOB) {
            Err(SubmitError::Validation(issues)) => {
                assert_eq!(issues.len(), 3);
                assert_eq!(issues[1].item_index, Some(1));
                assert_eq!(issues[2].item_index, Some(2));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn submit_request_parses_camel_case_json() {
        let json = r#"{
            "generatorType": "single-agent",
            "organizationId": "acme",
            "items": [{"topic": "Edge caching", "targetWordCount": 900, "keywords": ["cdn"]}],
            "settings": {"tone": "friendly", "modelOverride": "haiku"}
        }"#;
        let req: SubmitRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.generator_type, GeneratorType::SingleAgent);
        assert_eq!(req.items[0].category, "");
        assert_eq!(req.settings.model_override, Some(ModelTier::Haiku));
    }

    #[test]
    fn job_serialization_roundtrip() {
        let job = Job::new(request(2), 1);
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
