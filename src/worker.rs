//! Drives one item task through its pipeline.
//!
//! The runner owns the item for the whole run: it reads the stored copy
//! once, applies every transition locally and writes the slot back after
//! each one. No other task writes the same slot while it runs.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{FailureKind, PipelineConfigError, StageError, StoreError};
use crate::job::{ItemState, ItemTask, ItemTransition, Job, JobId, RetryPolicy, TransitionError};
use crate::pipeline::{Pipeline, PipelineRegistry, PipelineStage, StageContext, StageOutput};
use crate::store::{ContentStore, JobStore, LimitsService, Quota};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("job {job_id} has no item at index {index}")]
    ItemMissing { job_id: String, index: usize },

    #[error(transparent)]
    Pipeline(#[from] PipelineConfigError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),
}

/// Everything a worker needs to run an item, shared by the whole pool.
pub struct ItemRunner {
    store: Arc<dyn JobStore>,
    content: Arc<dyn ContentStore>,
    limits: Arc<dyn LimitsService>,
    pipelines: PipelineRegistry,
    retry: RetryPolicy,
    stage_timeout: Duration,
}

impl ItemRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        content: Arc<dyn ContentStore>,
        limits: Arc<dyn LimitsService>,
        pipelines: PipelineRegistry,
        retry: RetryPolicy,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            store,
            content,
            limits,
            pipelines,
            retry,
            stage_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    /// Run the item at `index` until it is terminal and return its final state.
    ///
    /// An item that is no longer `Queued` when the runner reads it was
    /// settled elsewhere (cancelled, or finished before a restart) and is
    /// left untouched.
    #[instrument(skip_all, fields(job_id = %job_id, item_index = index))]
    pub async fn run(&self, job_id: &JobId, index: usize) -> Result<ItemState, WorkerError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| WorkerError::JobNotFound(job_id.to_string()))?;
        let mut item = job
            .item(index)
            .cloned()
            .ok_or_else(|| WorkerError::ItemMissing {
                job_id: job_id.to_string(),
                index,
            })?;
        if item.state() != ItemState::Queued {
            debug!(state = %item.state(), "item already settled, skipping");
            return Ok(item.state());
        }
        let pipeline = self.pipelines.stages_for(job.generator_type)?;

        item.start()?;
        match self.store.update_item(job_id, &item).await {
            Ok(()) => {}
            Err(StoreError::TerminalItem { .. }) => {
                debug!("item was cancelled before it started");
                return Ok(ItemState::Cancelled);
            }
            Err(e) => return Err(e.into()),
        }
        debug!(topic = %item.input().topic, stages = pipeline.len(), "item started");

        loop {
            let Some(stage) = pipeline.stage(item.stage_index()) else {
                item.fail(
                    FailureKind::Validation,
                    format!(
                        "pipeline for {} has no stage {}",
                        job.generator_type,
                        item.stage_index()
                    ),
                )?;
                self.store.update_item(job_id, &item).await?;
                return Ok(item.state());
            };

            let transition = match self.run_stage(&job, &item, &pipeline, stage).await {
                Ok(output) => {
                    self.limits
                        .record_spend(&job.organization_id, output.cost_usd)
                        .await;
                    item.record_success(output)?
                }
                Err(e) => {
                    debug!(stage = stage.spec.name(), attempt = item.current_attempt(), error = %e, "stage failed");
                    item.record_failure(&e, &self.retry)?
                }
            };

            match transition {
                ItemTransition::Advance { stage_index } => {
                    debug!(stage_index, "stage succeeded");
                    self.store.update_item(job_id, &item).await?;
                }
                ItemTransition::Retry {
                    stage_index,
                    attempt,
                    delay,
                } => {
                    warn!(
                        stage_index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying stage"
                    );
                    self.store.update_item(job_id, &item).await?;
                    tokio::time::sleep(delay).await;
                }
                ItemTransition::Finished => {
                    self.finish(&job, &mut item).await?;
                    self.store.update_item(job_id, &item).await?;
                    return Ok(item.state());
                }
                ItemTransition::Failed => {
                    if let Some(err) = item.error() {
                        error!(
                            stage_index = err.stage_index,
                            attempts = err.attempts,
                            kind = %err.kind,
                            "item failed: {}",
                            err.message
                        );
                    }
                    self.store.update_item(job_id, &item).await?;
                    return Ok(item.state());
                }
            }
        }
    }

    /// Authorize, then run one attempt of one stage under the hard timeout.
    async fn run_stage(
        &self,
        job: &Job,
        item: &ItemTask,
        pipeline: &Pipeline,
        stage: &PipelineStage,
    ) -> Result<StageOutput, StageError> {
        if let Quota::Exhausted { reason } = self.limits.authorize(&job.organization_id).await {
            return Err(StageError::BudgetExceeded {
                organization_id: job.organization_id.clone(),
                reason,
            });
        }

        let ctx = StageContext {
            job_id: job.id.clone(),
            item_index: item.index(),
            stage_index: item.stage_index(),
            attempt: item.current_attempt(),
            params: item.input().clone(),
            settings: job.settings.clone(),
            prior: pipeline
                .stages()
                .iter()
                .map(|s| s.spec.kind)
                .zip(item.stage_outputs().iter().cloned())
                .collect(),
        };
        debug!(
            stage = stage.spec.name(),
            attempt = ctx.attempt,
            executor = stage.executor.name(),
            "running stage"
        );

        match tokio::time::timeout(self.stage_timeout, stage.executor.execute(&stage.spec, &ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout {
                after_ms: self.stage_timeout.as_millis() as u64,
            }),
        }
    }

    /// Persist the final content and complete the item. A content store
    /// failure fails the item instead.
    async fn finish(&self, job: &Job, item: &mut ItemTask) -> Result<(), WorkerError> {
        let content = item.stage_outputs().last().cloned().unwrap_or_default();
        match self
            .content
            .persist(&job.id, item.index(), &item.input().topic, &content)
            .await
        {
            Ok(content_ref) => {
                let result = item.complete(Some(content_ref))?;
                info!(
                    word_count = result.word_count,
                    cost_usd = result.cost_usd,
                    duration_ms = result.duration_ms,
                    "item completed"
                );
            }
            Err(e) => {
                error!(error = %e, "failed to persist content");
                item.fail(FailureKind::Storage, format!("content store: {e}"))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ItemInput, JobSettings, SubmitRequest};
    use crate::pipeline::{GeneratorType, SimulatedExecutor, StageExecutor, StageKind, StageSpec};
    use crate::store::{InMemoryContentStore, InMemoryJobStore, InMemoryLimits};
    use async_trait::async_trait;

    struct BrokenContentStore;

    #[async_trait]
    impl ContentStore for BrokenContentStore {
        async fn persist(&self, _: &JobId, _: usize, _: &str, _: &str) -> Result<String, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    fn request(generator_type: GeneratorType, topics: &[&str]) -> SubmitRequest {
        SubmitRequest {
            generator_type,
            organization_id: "acme".into(),
            items: topics
                .iter()
                .map(|t| ItemInput {
                    topic: t.to_string(),
                    category: "blog".into(),
                    target_word_count: 40,
                    keywords: vec!["rust".into()],
                })
                .collect(),
            settings: JobSettings::default(),
        }
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        content: Arc<InMemoryContentStore>,
        limits: Arc<InMemoryLimits>,
    }

    impl Harness {
        fn new(limits: InMemoryLimits) -> Self {
            Self {
                store: Arc::new(InMemoryJobStore::new()),
                content: Arc::new(InMemoryContentStore::new()),
                limits: Arc::new(limits),
            }
        }

        fn runner(&self, executor: Arc<dyn StageExecutor>, timeout: Duration) -> ItemRunner {
            ItemRunner::new(
                self.store.clone(),
                self.content.clone(),
                self.limits.clone(),
                PipelineRegistry::with_defaults(executor).unwrap(),
                policy(),
                timeout,
            )
        }

        async fn submit(&self, req: SubmitRequest) -> Job {
            let stages = crate::pipeline::default_stages(req.generator_type).len();
            let job = Job::new(req, stages);
            self.store.put(&job).await.unwrap();
            job
        }

        async fn item(&self, job: &Job, index: usize) -> ItemTask {
            self.store.get(&job.id).await.unwrap().unwrap().items()[index].clone()
        }
    }

    #[tokio::test]
    async fn multi_agent_item_runs_every_stage_and_persists() {
        let h = Harness::new(InMemoryLimits::unlimited());
        let runner = h.runner(Arc::new(SimulatedExecutor::new(Duration::ZERO)), Duration::from_secs(5));
        let job = h.submit(request(GeneratorType::MultiAgent, &["Async Rust"])).await;

        let state = runner.run(&job.id, 0).await.unwrap();

        assert_eq!(state, ItemState::Completed);
        let item = h.item(&job, 0).await;
        assert_eq!(item.stage_outputs().len(), 4);
        assert_eq!(item.attempts(), &[1, 1, 1, 1]);
        let result = item.result().unwrap();
        let content_ref = result.content_ref.as_deref().unwrap();
        assert_eq!(h.content.get(content_ref).as_deref(), Some(result.content.as_str()));
        assert!(h.limits.spent("acme") > 0.0);
    }

    #[tokio::test]
    async fn flaky_stage_is_retried_in_place() {
        let h = Harness::new(InMemoryLimits::unlimited());
        let exec = Arc::new(SimulatedExecutor::new(Duration::ZERO).fail_times(
            "Flaky",
            1,
            2,
            StageError::provider("503"),
        ));
        let runner = h.runner(exec.clone(), Duration::from_secs(5));
        let job = h.submit(request(GeneratorType::MultiAgent, &["Flaky"])).await;

        assert_eq!(runner.run(&job.id, 0).await.unwrap(), ItemState::Completed);
        let item = h.item(&job, 0).await;
        assert_eq!(item.attempts(), &[1, 3, 1, 1]);
        assert_eq!(exec.calls_for("Flaky", 0), 1);
        assert_eq!(exec.calls_for("Flaky", 1), 3);
    }

    #[tokio::test]
    async fn validation_error_fails_without_retry() {
        let h = Harness::new(InMemoryLimits::unlimited());
        let exec = Arc::new(SimulatedExecutor::new(Duration::ZERO).fail_times(
            "Bad",
            0,
            10,
            StageError::Validation("prompt too long".into()),
        ));
        let runner = h.runner(exec.clone(), Duration::from_secs(5));
        let job = h.submit(request(GeneratorType::SingleAgent, &["Bad"])).await;

        assert_eq!(runner.run(&job.id, 0).await.unwrap(), ItemState::Failed);
        assert_eq!(exec.calls_for("Bad", 0), 1);
        let item = h.item(&job, 0).await;
        assert_eq!(item.error().unwrap().kind, FailureKind::Validation);
    }

    #[tokio::test]
    async fn exhausted_budget_fails_before_calling_the_executor() {
        let h = Harness::new(InMemoryLimits::unlimited().with_budget("acme", 0.0));
        let exec = Arc::new(SimulatedExecutor::new(Duration::ZERO));
        let runner = h.runner(exec.clone(), Duration::from_secs(5));
        let job = h.submit(request(GeneratorType::SingleAgent, &["Pricey"])).await;

        assert_eq!(runner.run(&job.id, 0).await.unwrap(), ItemState::Failed);
        assert_eq!(exec.calls_for("Pricey", 0), 0);
        let item = h.item(&job, 0).await;
        let err = item.error().unwrap();
        assert_eq!(err.kind, FailureKind::BudgetExceeded);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn slow_stage_times_out_and_exhausts_retries() {
        let h = Harness::new(InMemoryLimits::unlimited());
        let exec = Arc::new(SimulatedExecutor::new(Duration::from_millis(200)));
        let runner = h.runner(exec.clone(), Duration::from_millis(10));
        let job = h.submit(request(GeneratorType::SingleAgent, &["Slow"])).await;

        assert_eq!(runner.run(&job.id, 0).await.unwrap(), ItemState::Failed);
        let item = h.item(&job, 0).await;
        let err = item.error().unwrap();
        assert_eq!(err.kind, FailureKind::Timeout);
        assert_eq!(err.stage_index, 0);
        assert_eq!(err.attempts, 3);
        assert_eq!(exec.calls_for("Slow", 0), 3);
    }

    #[tokio::test]
    async fn content_store_failure_fails_the_item() {
        let store = Arc::new(InMemoryJobStore::new());
        let runner = ItemRunner::new(
            store.clone(),
            Arc::new(BrokenContentStore),
            Arc::new(InMemoryLimits::unlimited()),
            PipelineRegistry::with_defaults(Arc::new(SimulatedExecutor::new(Duration::ZERO))).unwrap(),
            policy(),
            Duration::from_secs(5),
        );
        let job = Job::new(request(GeneratorType::SingleAgent, &["Lost"]), 1);
        store.put(&job).await.unwrap();

        assert_eq!(runner.run(&job.id, 0).await.unwrap(), ItemState::Failed);
        let stored = store.get(&job.id).await.unwrap().unwrap();
        let err = stored.items()[0].error().unwrap();
        assert_eq!(err.kind, FailureKind::Storage);
        assert!(err.message.contains("disk full"));
    }

    #[tokio::test]
    async fn settled_items_are_left_alone() {
        let h = Harness::new(InMemoryLimits::unlimited());
        let exec = Arc::new(SimulatedExecutor::new(Duration::ZERO));
        let runner = h.runner(exec.clone(), Duration::from_secs(5));
        let job = h.submit(request(GeneratorType::SingleAgent, &["Gone"])).await;

        let mut item = job.items()[0].clone();
        item.cancel().unwrap();
        h.store.update_item(&job.id, &item).await.unwrap();

        assert_eq!(runner.run(&job.id, 0).await.unwrap(), ItemState::Cancelled);
        assert_eq!(exec.calls_for("Gone", 0), 0);
    }

    #[tokio::test]
    async fn stage_context_carries_prior_outputs_in_order() {
        struct Recorder(parking_lot::Mutex<Vec<Vec<StageKind>>>);

        #[async_trait]
        impl StageExecutor for Recorder {
            fn name(&self) -> &str {
                "recorder"
            }

            async fn execute(&self, spec: &StageSpec, ctx: &StageContext) -> Result<StageOutput, StageError> {
                self.0.lock().push(ctx.prior.iter().map(|(k, _)| *k).collect());
                Ok(StageOutput {
                    output: format!("{} output", spec.name()),
                    tokens_used: Default::default(),
                    cost_usd: 0.0,
                })
            }
        }

        let h = Harness::new(InMemoryLimits::unlimited());
        let recorder = Arc::new(Recorder(parking_lot::Mutex::new(Vec::new())));
        let runner = h.runner(recorder.clone(), Duration::from_secs(5));
        let job = h.submit(request(GeneratorType::MultiAgent, &["Ordered"])).await;
        runner.run(&job.id, 0).await.unwrap();

        let seen = recorder.0.lock().clone();
        assert_eq!(seen.len(), 4);
        assert!(seen[0].is_empty());
        assert_eq!(seen[3], vec![StageKind::Outline, StageKind::Draft, StageKind::SeoOptimize]);
    }

    #[tokio::test]
    async fn unknown_job_is_an_error() {
        let h = Harness::new(InMemoryLimits::unlimited());
        let runner = h.runner(Arc::new(SimulatedExecutor::new(Duration::ZERO)), Duration::from_secs(1));
        let err = runner.run(&JobId::from("missing"), 0).await.unwrap_err();
        assert!(matches!(err, WorkerError::JobNotFound(_)));
    }
}
