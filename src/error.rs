use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::GeneratorType;

/// Failure of a single stage invocation.
///
/// The executor never retries on its own; the owning item task decides
/// whether to run the stage again based on [`StageError::is_retryable`].
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum StageError {
    /// The LLM provider failed (rate limit, 5xx, malformed response,
    /// rejected credentials).
    #[error("provider error: {message}")]
    Provider {
        message: String,
        status: Option<u16>,
    },

    /// The stage exceeded its deadline.
    #[error("stage timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// The stage input or request was rejected as invalid.
    #[error("validation error: {0}")]
    Validation(String),

    /// The organization's cost or rate cap was hit.
    #[error("budget exceeded for organization {organization_id}: {reason}")]
    BudgetExceeded {
        organization_id: String,
        reason: String,
    },
}

impl StageError {
    pub fn provider(message: impl Into<String>) -> Self {
        StageError::Provider {
            message: message.into(),
            status: None,
        }
    }

    /// Only provider failures and timeouts are worth another attempt. A provider
    /// that refused our credentials (401/403) keeps refusing them.
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Provider { status, .. } => !matches!(status, Some(401 | 403)),
            StageError::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            StageError::Provider { .. } => FailureKind::Provider,
            StageError::Timeout { .. } => FailureKind::Timeout,
            StageError::Validation(_) => FailureKind::Validation,
            StageError::BudgetExceeded { .. } => FailureKind::BudgetExceeded,
        }
    }
}

/// Classifies an item failure for reporting.
///
/// `BudgetExceeded` marks an organization cap and never an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    Provider,
    Timeout,
    Validation,
    BudgetExceeded,
    /// The finished content, or the item itself, could not be persisted.
    Storage,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Provider => write!(f, "ProviderError"),
            FailureKind::Timeout => write!(f, "TimeoutError"),
            FailureKind::Validation => write!(f, "ValidationError"),
            FailureKind::BudgetExceeded => write!(f, "BudgetExceededError"),
            FailureKind::Storage => write!(f, "StorageError"),
        }
    }
}

/// One problem found while validating a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    /// Index of the offending item, `None` for request-level problems.
    pub item_index: Option<usize>,
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn request(field: &str, message: impl Into<String>) -> Self {
        Self {
            item_index: None,
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn item(index: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            item_index: Some(index),
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.item_index {
            Some(i) => write!(f, "items[{i}].{}: {}", self.field, self.message),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A pipeline that cannot run, detected before any job is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineConfigError {
    #[error("generator type {0} has no pipeline stages")]
    NoStages(GeneratorType),

    #[error("stage {stage} requires output of {required}, which does not run before it")]
    MissingInput { stage: String, required: String },
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid submission: {}", join_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error(transparent)]
    PipelineConfig(#[from] PipelineConfigError),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("job {job_id} has no item at index {index}")]
    ItemOutOfRange { job_id: String, index: usize },

    #[error("item {index} of job {job_id} is already terminal")]
    TerminalItem { job_id: String, index: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StageError::provider("503").is_retryable());
        assert!(StageError::Timeout { after_ms: 10 }.is_retryable());
        assert!(!StageError::Validation("empty topic".into()).is_retryable());
        assert!(
            !StageError::BudgetExceeded {
                organization_id: "org".into(),
                reason: "cap".into()
            }
            .is_retryable()
        );
        let denied = StageError::Provider {
            message: "invalid x-api-key".into(),
            status: Some(401),
        };
        assert!(!denied.is_retryable());
        assert_eq!(denied.kind(), FailureKind::Provider);
    }

    #[test]
    fn budget_is_distinct_from_provider() {
        let err = StageError::BudgetExceeded {
            organization_id: "acme".into(),
            reason: "monthly cap reached".into(),
        };
        assert_eq!(err.kind(), FailureKind::BudgetExceeded);
        assert_ne!(err.kind(), StageError::provider("x").kind());
        assert_eq!(
            err.to_string(),
            "budget exceeded for organization acme: monthly cap reached"
        );
    }

    #[test]
    fn validation_error_lists_every_issue() {
        let err = SubmitError::Validation(vec![
            ValidationIssue::request("items", "must contain 1 to 50 items"),
            ValidationIssue::item(2, "topic", "must not be empty"),
        ]);
        assert_eq!(
            err.to_string(),
            "invalid submission: items: must contain 1 to 50 items; items[2].topic: must not be empty"
        );
    }

    #[test]
    fn failure_kind_display() {
        assert_eq!(FailureKind::Timeout.to_string(), "TimeoutError");
        assert_eq!(FailureKind::BudgetExceeded.to_string(), "BudgetExceededError");
    }
}
