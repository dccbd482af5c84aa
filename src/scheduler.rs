//! Job queue and the deployment-wide worker pool.
//!
//! Submitted items wait in a single FIFO backlog shared by every job. A
//! fixed number of workers pull from it; an organization that already has
//! its cap of items in flight is skipped until one of them settles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::InkflowConfig;
use crate::error::{FailureKind, QueueError, StoreError, SubmitError};
use crate::job::{ItemState, Job, JobId, MAX_ITEMS_PER_JOB, RetryPolicy, SubmitRequest};
use crate::pipeline::PipelineRegistry;
use crate::status::{JobStatusSnapshot, StatusReporter};
use crate::store::{ContentStore, JobStore, LimitsService};
use crate::worker::{ItemRunner, WorkerError};

/// Queue and worker pool settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Worker pool size, shared by all jobs.
    pub max_workers: usize,
    /// Default cap of in-flight items per organization.
    pub per_org_concurrency: Option<usize>,
    /// Per-organization overrides of the cap.
    pub org_concurrency: HashMap<String, usize>,
    pub max_items_per_job: usize,
    pub retry: RetryPolicy,
    /// Hard deadline for one stage call.
    pub stage_timeout: Duration,
    /// How often idle workers re-check the backlog.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            per_org_concurrency: None,
            org_concurrency: HashMap::new(),
            max_items_per_job: MAX_ITEMS_PER_JOB,
            retry: RetryPolicy::default(),
            stage_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl From<&InkflowConfig> for QueueConfig {
    fn from(config: &InkflowConfig) -> Self {
        Self {
            max_workers: config.max_workers.max(1),
            per_org_concurrency: config.per_org_concurrency,
            org_concurrency: config.org_concurrency.clone(),
            max_items_per_job: config.max_items_per_job.clamp(1, MAX_ITEMS_PER_JOB),
            retry: config.retry_policy(),
            stage_timeout: config.stage_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

impl QueueConfig {
    /// An organization's cap, never below one so its items always drain.
    fn cap_for(&self, organization_id: &str) -> Option<usize> {
        self.org_concurrency
            .get(organization_id)
            .copied()
            .or(self.per_org_concurrency)
            .map(|cap| cap.max(1))
    }

    fn items_limit(&self) -> usize {
        self.max_items_per_job.clamp(1, MAX_ITEMS_PER_JOB)
    }
}

#[derive(Debug, Clone)]
struct QueuedItem {
    job_id: JobId,
    organization_id: String,
    index: usize,
}

/// Items waiting for a worker plus the items workers have claimed.
#[derive(Default)]
struct Backlog {
    queue: VecDeque<QueuedItem>,
    claimed: HashSet<(JobId, usize)>,
    in_flight: HashMap<String, usize>,
}

impl Backlog {
    fn push(&mut self, item: QueuedItem) {
        self.queue.push_back(item);
    }

    /// Claim the oldest item whose organization is under its cap.
    fn claim_next(&mut self, config: &QueueConfig) -> Option<QueuedItem> {
        let pos = self.queue.iter().position(|q| {
            config.cap_for(&q.organization_id).is_none_or(|cap| {
                self.in_flight.get(&q.organization_id).copied().unwrap_or(0) < cap
            })
        })?;
        let item = self.queue.remove(pos)?;
        *self.in_flight.entry(item.organization_id.clone()).or_insert(0) += 1;
        self.claimed.insert((item.job_id.clone(), item.index));
        Some(item)
    }

    fn release(&mut self, item: &QueuedItem) {
        self.claimed.remove(&(item.job_id.clone(), item.index));
        if let Some(n) = self.in_flight.get_mut(&item.organization_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                self.in_flight.remove(&item.organization_id);
            }
        }
    }

    /// Drop a job's waiting items and return the indexes a worker has claimed.
    fn withdraw_job(&mut self, job_id: &JobId) -> HashSet<usize> {
        self.queue.retain(|q| q.job_id != *job_id);
        self.claimed_for(job_id)
    }

    fn claimed_for(&self, job_id: &JobId) -> HashSet<usize> {
        self.claimed
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, index)| *index)
            .collect()
    }

    fn is_waiting(&self, job_id: &JobId, index: usize) -> bool {
        self.queue
            .iter()
            .any(|q| q.job_id == *job_id && q.index == index)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

struct Shared {
    runner: ItemRunner,
    config: QueueConfig,
    backlog: Mutex<Backlog>,
    /// Signalled when the backlog gains items or an org slot frees up.
    work_ready: Notify,
    /// Signalled whenever an item reaches a terminal state.
    settled: Notify,
    shutdown: CancellationToken,
}

impl Shared {
    fn store(&self) -> &Arc<dyn JobStore> {
        self.runner.store()
    }

    fn claim_next(&self) -> Option<QueuedItem> {
        self.backlog.lock().claim_next(&self.config)
    }

    /// Fail an item whose run aborted on an infrastructure error, so the
    /// job can still settle.
    async fn settle_stranded(&self, entry: &QueuedItem, reason: &WorkerError) {
        let Ok(Some(job)) = self.store().get(&entry.job_id).await else {
            return;
        };
        let Some(mut item) = job.item(entry.index).cloned() else {
            return;
        };
        if item.state() == ItemState::Queued && item.start().is_err() {
            return;
        }
        if item.fail(FailureKind::Storage, reason.to_string()).is_ok()
            && let Err(e) = self.store().update_item(&entry.job_id, &item).await
        {
            error!(job_id = %entry.job_id, item_index = entry.index, error = %e, "could not record stranded item");
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    debug!(worker, "worker started");

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        let Some(entry) = shared.claim_next() else {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = shared.work_ready.notified() => {}
                _ = tokio::time::sleep(shared.config.poll_interval) => {}
            }
            continue;
        };

        match shared.runner.run(&entry.job_id, entry.index).await {
            Ok(state) => debug!(worker, job_id = %entry.job_id, item_index = entry.index, %state, "item settled"),
            Err(e) => {
                error!(worker, job_id = %entry.job_id, item_index = entry.index, error = %e, "item run aborted");
                shared.settle_stranded(&entry, &e).await;
            }
        }

        shared.backlog.lock().release(&entry);
        shared.settled.notify_waiters();
        shared.work_ready.notify_waiters();
    }

    debug!(worker, "worker stopped");
}

/// Accepts jobs and runs their items on a bounded worker pool.
pub struct JobQueue {
    shared: Arc<Shared>,
    workers: Mutex<Option<JoinSet<()>>>,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        content: Arc<dyn ContentStore>,
        limits: Arc<dyn LimitsService>,
        pipelines: PipelineRegistry,
        config: QueueConfig,
    ) -> Self {
        let runner = ItemRunner::new(
            store,
            content,
            limits,
            pipelines,
            config.retry.clone(),
            config.stage_timeout,
        );
        Self {
            shared: Arc::new(Shared {
                runner,
                config,
                backlog: Mutex::new(Backlog::default()),
                work_ready: Notify::new(),
                settled: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            workers: Mutex::new(None),
        }
    }

    /// Spawn the worker pool. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            warn!("job queue already started");
            return;
        }

        info!(
            max_workers = self.shared.config.max_workers,
            per_org_concurrency = ?self.shared.config.per_org_concurrency,
            "starting worker pool"
        );
        let mut join_set = JoinSet::new();
        for i in 0..self.shared.config.max_workers {
            join_set.spawn(worker_loop(self.shared.clone(), i));
        }
        *workers = Some(join_set);
    }

    /// Validate a batch, create its job with every item queued, and hand the
    /// items to the pool. Nothing is stored when validation fails.
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId, SubmitError> {
        request.validate(self.shared.config.items_limit())?;
        let pipeline = self
            .shared
            .runner
            .pipelines()
            .stages_for(request.generator_type)?;

        let job = Job::new(request, pipeline.len());
        self.shared.store().put(&job).await?;
        {
            let mut backlog = self.shared.backlog.lock();
            for item in job.items() {
                backlog.push(QueuedItem {
                    job_id: job.id.clone(),
                    organization_id: job.organization_id.clone(),
                    index: item.index(),
                });
            }
        }

        info!(
            job_id = %job.id,
            organization_id = %job.organization_id,
            generator_type = %job.generator_type,
            items = job.items().len(),
            stages = pipeline.len(),
            "job submitted"
        );
        self.shared.work_ready.notify_waiters();
        Ok(job.id)
    }

    /// Current snapshot of a job. Never waits on workers.
    pub async fn get_status(&self, job_id: &JobId) -> Result<JobStatusSnapshot, QueueError> {
        let job = self
            .shared
            .store()
            .get(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        Ok(StatusReporter::snapshot(&job))
    }

    /// Cancel every item of the job that no worker has claimed yet.
    /// Claimed items run to completion.
    pub async fn cancel(&self, job_id: &JobId) -> Result<JobStatusSnapshot, QueueError> {
        let store = self.shared.store();
        if store.get(job_id).await?.is_none() {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }
        store.mark_cancel_requested(job_id).await?;

        let claimed = self.shared.backlog.lock().withdraw_job(job_id);
        let job = store
            .get(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        let mut cancelled = 0;
        for item in job.items() {
            if item.state() != ItemState::Queued || claimed.contains(&item.index()) {
                continue;
            }
            let mut item = item.clone();
            if item.cancel().is_ok() {
                store.update_item(job_id, &item).await?;
                cancelled += 1;
            }
        }

        info!(job_id = %job_id, cancelled, in_flight = claimed.len(), "job cancel requested");
        self.shared.settled.notify_waiters();
        self.get_status(job_id).await
    }

    /// Re-enqueue a stored job's queued items, for instance after a restart
    /// with a persistent store. Items left `processing` by a dead process
    /// are failed so the job can settle. Returns how many items were queued.
    pub async fn resume(&self, job_id: &JobId) -> Result<usize, QueueError> {
        let store = self.shared.store();
        let job = store
            .get(job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        let mut requeue = Vec::new();
        let mut interrupted = Vec::new();
        {
            let backlog = self.shared.backlog.lock();
            let claimed = backlog.claimed_for(job_id);
            for item in job.items() {
                if claimed.contains(&item.index()) || backlog.is_waiting(job_id, item.index()) {
                    continue;
                }
                match item.state() {
                    ItemState::Queued if !job.cancel_requested => requeue.push(item.index()),
                    ItemState::Queued | ItemState::Processing => interrupted.push(item.clone()),
                    _ => {}
                }
            }
        }

        for mut item in interrupted {
            let outcome = if item.state() == ItemState::Queued {
                item.cancel()
            } else {
                item.fail(FailureKind::Storage, "interrupted before the item finished")
            };
            if outcome.is_err() {
                continue;
            }
            match store.update_item(job_id, &item).await {
                Ok(()) => {}
                Err(StoreError::TerminalItem { index, .. }) => {
                    debug!(job_id = %job_id, index, "item settled while resuming, leaving it");
                }
                Err(e) => return Err(e.into()),
            }
        }

        {
            let mut backlog = self.shared.backlog.lock();
            for &index in &requeue {
                backlog.push(QueuedItem {
                    job_id: job_id.clone(),
                    organization_id: job.organization_id.clone(),
                    index,
                });
            }
        }
        info!(job_id = %job_id, requeued = requeue.len(), "job resumed");
        self.shared.work_ready.notify_waiters();
        self.shared.settled.notify_waiters();
        Ok(requeue.len())
    }

    /// Wait until the job reaches a terminal status, or the queue shuts down.
    pub async fn wait_for_terminal(&self, job_id: &JobId) -> Result<JobStatusSnapshot, QueueError> {
        loop {
            let notified = self.shared.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let snapshot = self.get_status(job_id).await?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.shutdown.cancelled() => return Ok(snapshot),
                _ = tokio::time::sleep(self.shared.config.poll_interval) => {}
            }
        }
    }

    /// Items still waiting for a worker, across all jobs.
    pub fn backlog_len(&self) -> usize {
        self.shared.backlog.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some() && !self.shared.shutdown.is_cancelled()
    }

    /// Stop accepting work and wait for every worker to finish its current item.
    pub async fn shutdown(&self) {
        info!("stopping worker pool");
        self.shared.shutdown.cancel();

        let join_set = self.workers.lock().take();
        if let Some(mut join_set) = join_set {
            while let Some(res) = join_set.join_next().await {
                if let Err(e) = res {
                    error!(error = %e, "worker task panicked");
                }
            }
        }

        info!(waiting = self.backlog_len(), "worker pool stopped");
    }
}
