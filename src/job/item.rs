use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{FailureKind, StageError, ValidationIssue};
use crate::pipeline::{StageOutput, TokenUsage, round_usd};

/// Input parameters of one topic. Immutable once the item is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemInput {
    pub topic: String,
    #[serde(default)]
    pub category: String,
    pub target_word_count: u32,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl ItemInput {
    pub fn validate(&self, index: usize) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if self.topic.trim().is_empty() {
            issues.push(ValidationIssue::item(index, "topic", "must not be empty"));
        }
        if self.target_word_count == 0 {
            issues.push(ValidationIssue::item(
                index,
                "targetWordCount",
                "must be greater than zero",
            ));
        }
        issues
    }
}

/// Lifecycle of an item task.
///
/// `Queued -> Processing -> Completed | Failed`, or `Queued -> Cancelled`.
/// The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemState::Completed | ItemState::Failed | ItemState::Cancelled
        )
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Queued => write!(f, "queued"),
            ItemState::Processing => write!(f, "processing"),
            ItemState::Completed => write!(f, "completed"),
            ItemState::Failed => write!(f, "failed"),
            ItemState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-stage retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts per stage, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    /// delay = min(base_delay_ms * 2^(attempt - 1), max_delay_ms)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Populated only for completed items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub content: String,
    pub content_ref: Option<String>,
    pub word_count: u32,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

/// Populated only for failed items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub kind: FailureKind,
    pub message: String,
    /// Stage at which the item failed.
    pub stage_index: usize,
    /// Attempts spent on that stage.
    pub attempts: u32,
}

/// What the runner should do after a stage outcome was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemTransition {
    /// The stage succeeded and the next one is ready to run.
    Advance { stage_index: usize },
    /// Run the same stage again after `delay`.
    Retry {
        stage_index: usize,
        attempt: u32,
        delay: Duration,
    },
    /// The final stage succeeded; the content awaits persistence.
    Finished,
    /// The item reached `Failed`.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} an item that is {from}")]
pub struct TransitionError {
    pub from: ItemState,
    pub action: &'static str,
}

/// The generation of one topic through a pipeline.
///
/// Only the worker that owns the item mutates it; every mutation goes
/// through a method that checks the current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemTask {
    index: usize,
    input: ItemInput,
    state: ItemState,
    stage_count: usize,
    stage_index: usize,
    /// Attempts started, one counter per stage.
    attempts: Vec<u32>,
    stage_outputs: Vec<String>,
    tokens: TokenUsage,
    cost_usd: f64,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    result: Option<ItemResult>,
    error: Option<ItemError>,
}

impl ItemTask {
    pub fn new(index: usize, input: ItemInput, stage_count: usize) -> Self {
        Self {
            index,
            input,
            state: ItemState::Queued,
            stage_count,
            stage_index: 0,
            attempts: vec![0; stage_count],
            stage_outputs: Vec::new(),
            tokens: TokenUsage::default(),
            cost_usd: 0.0,
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn input(&self) -> &ItemInput {
        &self.input
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn stage_count(&self) -> usize {
        self.stage_count
    }

    pub fn attempts(&self) -> &[u32] {
        &self.attempts
    }

    /// Attempts started on the current stage.
    pub fn current_attempt(&self) -> u32 {
        self.attempts.get(self.stage_index).copied().unwrap_or(0)
    }

    pub fn stage_outputs(&self) -> &[String] {
        &self.stage_outputs
    }

    pub fn tokens(&self) -> TokenUsage {
        self.tokens
    }

    /// Running cost, including stages of items that later failed.
    pub fn cost_usd(&self) -> f64 {
        self.cost_usd
    }

    pub fn result(&self) -> Option<&ItemResult> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&ItemError> {
        self.error.as_ref()
    }

    fn ensure(&self, expected: ItemState, action: &'static str) -> Result<(), TransitionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.state,
                action,
            })
        }
    }

    fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        self.started_at
            .map(|start| (now - start).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// A worker picked the item up: `Queued -> Processing`, stage 0, attempt 1.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.ensure(ItemState::Queued, "start")?;
        self.state = ItemState::Processing;
        self.stage_index = 0;
        if let Some(first) = self.attempts.first_mut() {
            *first = 1;
        }
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Fold a successful stage into the running totals and move on.
    pub fn record_success(&mut self, output: StageOutput) -> Result<ItemTransition, TransitionError> {
        self.ensure(ItemState::Processing, "record a stage result for")?;
        if self.stage_outputs.len() > self.stage_index {
            return Err(TransitionError {
                from: self.state,
                action: "record a second result for the same stage of",
            });
        }
        self.tokens.add(output.tokens_used);
        self.cost_usd = round_usd(self.cost_usd + output.cost_usd);
        self.stage_outputs.push(output.output);

        if self.stage_index + 1 < self.stage_count {
            self.stage_index += 1;
            self.attempts[self.stage_index] = 1;
            Ok(ItemTransition::Advance {
                stage_index: self.stage_index,
            })
        } else {
            Ok(ItemTransition::Finished)
        }
    }

    /// Record a stage failure and decide between retrying the same stage
    /// and failing the item.
    pub fn record_failure(
        &mut self,
        error: &StageError,
        policy: &RetryPolicy,
    ) -> Result<ItemTransition, TransitionError> {
        self.ensure(ItemState::Processing, "record a stage failure for")?;
        let attempt = self.current_attempt();
        if error.is_retryable() && attempt < policy.max_attempts {
            let delay = policy.delay_for_attempt(attempt);
            self.attempts[self.stage_index] = attempt + 1;
            return Ok(ItemTransition::Retry {
                stage_index: self.stage_index,
                attempt: attempt + 1,
                delay,
            });
        }
        self.fail(error.kind(), error.to_string())?;
        Ok(ItemTransition::Failed)
    }

    /// `Processing -> Completed` once every stage has produced output.
    pub fn complete(&mut self, content_ref: Option<String>) -> Result<&ItemResult, TransitionError> {
        self.ensure(ItemState::Processing, "complete")?;
        if self.stage_outputs.len() != self.stage_count {
            return Err(TransitionError {
                from: self.state,
                action: "complete an unfinished pipeline for",
            });
        }
        let now = Utc::now();
        let content = self.stage_outputs.last().cloned().unwrap_or_default();
        let result = ItemResult {
            word_count: content.split_whitespace().count() as u32,
            content,
            content_ref,
            tokens: self.tokens,
            cost_usd: self.cost_usd,
            duration_ms: self.elapsed_ms(now),
        };
        self.state = ItemState::Completed;
        self.finished_at = Some(now);
        Ok(&*self.result.insert(result))
    }

    /// `Processing -> Failed` at the current stage.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure(ItemState::Processing, "fail")?;
        self.state = ItemState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(ItemError {
            kind,
            message: message.into(),
            stage_index: self.stage_index,
            attempts: self.current_attempt(),
        });
        Ok(())
    }

    /// `Queued -> Cancelled`. In-flight items cannot be cancelled.
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.ensure(ItemState::Queued, "cancel")?;
        self.state = ItemState::Cancelled;
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(topic: &str) -> ItemInput {
        ItemInput {
            topic: topic.into(),
            category: "blog".into(),
            target_word_count: 500,
            keywords: vec![],
        }
    }

    fn output(text: &str) -> StageOutput {
        StageOutput {
            output: text.into(),
            tokens_used: TokenUsage::new(100, 50),
            cost_usd: 0.000_75,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        }
    }

    #[test]
    fn validation_reports_each_bad_field() {
        let bad = ItemInput {
            topic: "  ".into(),
            category: String::new(),
            target_word_count: 0,
            keywords: vec![],
        };
        let issues = bad.validate(4);
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| i.item_index == Some(4)));
        assert!(input("ok").validate(0).is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(p.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(p.delay_for_attempt(80), Duration::from_millis(1000));
    }

    #[test]
    fn happy_path_walks_all_stages() {
        let mut item = ItemTask::new(0, input("Rust"), 3);
        item.start().unwrap();
        assert_eq!(item.state(), ItemState::Processing);

        assert_eq!(
            item.record_success(output("outline")).unwrap(),
            ItemTransition::Advance { stage_index: 1 }
        );
        assert_eq!(
            item.record_success(output("draft")).unwrap(),
            ItemTransition::Advance { stage_index: 2 }
        );
        assert_eq!(
            item.record_success(output("final words here")).unwrap(),
            ItemTransition::Finished
        );

        let result = item.complete(Some("ref-1".into())).unwrap();
        assert_eq!(result.content, "final words here");
        assert_eq!(result.word_count, 3);
        assert_eq!(result.tokens, TokenUsage::new(300, 150));
        assert_eq!(result.cost_usd, 0.00225);
        assert_eq!(item.state(), ItemState::Completed);
        assert_eq!(item.attempts(), &[1, 1, 1]);
    }

    #[test]
    fn retry_then_succeed_counts_attempts_on_same_stage() {
        let mut item = ItemTask::new(1, input("Flaky"), 2);
        item.start().unwrap();
        let err = StageError::provider("503");

        let t = item.record_failure(&err, &policy()).unwrap();
        assert_eq!(
            t,
            ItemTransition::Retry {
                stage_index: 0,
                attempt: 2,
                delay: Duration::from_millis(100)
            }
        );
        let t = item.record_failure(&err, &policy()).unwrap();
        assert!(matches!(t, ItemTransition::Retry { attempt: 3, .. }));

        item.record_success(output("outline")).unwrap();
        assert_eq!(item.attempts()[0], 3);
        assert_eq!(item.stage_index(), 1);
    }

    #[test]
    fn exhausted_retries_fail_at_the_failing_stage() {
        let mut item = ItemTask::new(0, input("Doomed"), 2);
        item.start().unwrap();
        item.record_success(output("outline")).unwrap();

        let err = StageError::Timeout { after_ms: 50 };
        assert!(matches!(
            item.record_failure(&err, &policy()).unwrap(),
            ItemTransition::Retry { .. }
        ));
        assert!(matches!(
            item.record_failure(&err, &policy()).unwrap(),
            ItemTransition::Retry { .. }
        ));
        assert_eq!(
            item.record_failure(&err, &policy()).unwrap(),
            ItemTransition::Failed
        );

        assert_eq!(item.state(), ItemState::Failed);
        let error = item.error().unwrap();
        assert_eq!(error.stage_index, 1);
        assert_eq!(error.attempts, 3);
        assert_eq!(error.kind, FailureKind::Timeout);
        assert!(item.result().is_none());
    }

    #[test]
    fn non_retryable_error_fails_immediately() {
        let mut item = ItemTask::new(0, input("Over budget"), 1);
        item.start().unwrap();
        let err = StageError::BudgetExceeded {
            organization_id: "acme".into(),
            reason: "cap".into(),
        };
        assert_eq!(
            item.record_failure(&err, &policy()).unwrap(),
            ItemTransition::Failed
        );
        assert_eq!(item.error().unwrap().kind, FailureKind::BudgetExceeded);
        assert_eq!(item.error().unwrap().attempts, 1);
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        let mut item = ItemTask::new(0, input("Done"), 1);
        item.start().unwrap();
        item.fail(FailureKind::Provider, "gone").unwrap();

        assert!(item.start().is_err());
        assert!(item.record_success(output("late")).is_err());
        assert!(item.cancel().is_err());
        assert!(item.complete(None).is_err());
        assert_eq!(item.state(), ItemState::Failed);
    }

    #[test]
    fn only_queued_items_can_be_cancelled() {
        let mut queued = ItemTask::new(0, input("a"), 1);
        queued.cancel().unwrap();
        assert_eq!(queued.state(), ItemState::Cancelled);
        assert!(queued.state().is_terminal());

        let mut running = ItemTask::new(1, input("b"), 1);
        running.start().unwrap();
        let err = running.cancel().unwrap_err();
        assert_eq!(err.to_string(), "cannot cancel an item that is processing");
    }

    #[test]
    fn complete_requires_every_stage() {
        let mut item = ItemTask::new(0, input("Half"), 2);
        item.start().unwrap();
        item.record_success(output("outline")).unwrap();
        assert!(item.complete(None).is_err());
        assert_eq!(item.state(), ItemState::Processing);
    }
}
