use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use inkflow::anthropic::AnthropicClient;
use inkflow::cli::{Cli, Command};
use inkflow::config::InkflowConfig;
use inkflow::error::StageError;
use inkflow::job::{ItemInput, JobId, JobSettings, SubmitRequest};
use inkflow::logging;
use inkflow::pipeline::{
    GeneratorType, LlmStageExecutor, ModelTier, PipelineRegistry, SimulatedExecutor, StageExecutor,
};
use inkflow::scheduler::{JobQueue, QueueConfig};
use inkflow::status::JobStatusSnapshot;
use inkflow::store::{
    ContentStore, FileContentStore, FileJobStore, InMemoryContentStore, InMemoryJobStore,
    InMemoryLimits, JobStore,
};
use inkflow::ui::{self, JobProgress};

/// A batch file. Generator type and organization may come from the CLI instead.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchFile {
    generator_type: Option<GeneratorType>,
    organization_id: Option<String>,
    items: Vec<ItemInput>,
    #[serde(default)]
    settings: JobSettings,
}

fn load_batch(path: &Path) -> Result<BatchFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let batch = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&contents)
            .with_context(|| format!("invalid TOML batch in {}", path.display()))?,
        Some("json") => serde_json::from_str(&contents)
            .with_context(|| format!("invalid JSON batch in {}", path.display()))?,
        other => bail!("unsupported batch file extension {other:?}, expected .json or .toml"),
    };
    Ok(batch)
}

fn build_executor(config: &InkflowConfig) -> Result<Arc<dyn StageExecutor>> {
    if config.api_key.is_empty() {
        warn!("no API key configured, stages run on the simulated executor");
        return Ok(Arc::new(
            SimulatedExecutor::new(Duration::from_millis(150)).with_pricing(config.pricing.clone()),
        ));
    }
    let client = AnthropicClient::new(config.api_key.clone(), config.stage_timeout())?;
    Ok(Arc::new(
        LlmStageExecutor::new(client, config.pricing.clone())
            .with_request_timeout(config.stage_timeout()),
    ))
}

fn build_limits(config: &InkflowConfig) -> InMemoryLimits {
    config
        .budgets
        .iter()
        .fold(InMemoryLimits::unlimited(), |limits, (org, usd)| {
            limits.with_budget(org.clone(), *usd)
        })
}

async fn job_store(state_dir: Option<&Path>) -> Result<Arc<dyn JobStore>> {
    let store: Arc<dyn JobStore> = match state_dir {
        Some(dir) => Arc::new(FileJobStore::open(dir).await?),
        None => Arc::new(InMemoryJobStore::new()),
    };
    Ok(store)
}

fn build_queue(
    config: &InkflowConfig,
    store: Arc<dyn JobStore>,
    content: Arc<dyn ContentStore>,
    executor: Arc<dyn StageExecutor>,
) -> Result<JobQueue> {
    let pipelines = PipelineRegistry::with_defaults(executor)?;
    Ok(JobQueue::new(
        store,
        content,
        Arc::new(build_limits(config)),
        pipelines,
        QueueConfig::from(config),
    ))
}

/// Poll the job to a terminal state, drawing progress. Ctrl-C cancels the
/// job's queued items once; in-flight items still finish.
async fn follow(queue: &JobQueue, job_id: &JobId, poll: Duration) -> Result<JobStatusSnapshot> {
    let first = queue.get_status(job_id).await?;
    let mut progress = JobProgress::start(job_id.as_str(), first.progress.total);
    let mut cancelled = false;

    loop {
        let snapshot = queue.get_status(job_id).await?;
        progress.update(&snapshot);
        if snapshot.status.is_terminal() {
            progress.finish(&snapshot);
            return Ok(snapshot);
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            res = tokio::signal::ctrl_c(), if !cancelled => {
                res?;
                cancelled = true;
                warn!(job_id = %job_id, "interrupted, cancelling queued items");
                queue.cancel(job_id).await?;
            }
        }
    }
}

async fn run_to_end(
    queue: JobQueue,
    request: SubmitRequest,
    poll: Duration,
) -> Result<JobStatusSnapshot> {
    queue.start();
    let job_id = queue.submit(request).await?;
    info!(job_id = %job_id, "job accepted");
    let snapshot = follow(&queue, &job_id, poll).await;
    queue.shutdown().await;
    snapshot
}

const DEMO_TOPICS: &[&str] = &[
    "Choosing a CDN for a small SaaS",
    "Writing onboarding emails that convert",
    "A beginner guide to technical SEO",
    "How to plan a content calendar",
    "Measuring blog ROI without vanity metrics",
    "Repurposing webinars into articles",
    "Interviewing customers for case studies",
    "Internal linking strategies that scale",
];

fn demo_request(items: usize, model_override: Option<ModelTier>) -> SubmitRequest {
    SubmitRequest {
        generator_type: GeneratorType::MultiAgent,
        organization_id: "demo".into(),
        items: (0..items)
            .map(|i| {
                let base = DEMO_TOPICS[i % DEMO_TOPICS.len()];
                let topic = if i < DEMO_TOPICS.len() {
                    base.to_string()
                } else {
                    format!("{base} (part {})", i / DEMO_TOPICS.len() + 1)
                };
                ItemInput {
                    topic,
                    category: "marketing".into(),
                    target_word_count: 250 + (i as u32 % 4) * 150,
                    keywords: vec!["content".into(), "growth".into()],
                }
            })
            .collect(),
        settings: JobSettings {
            tone: Some("practical".into()),
            audience: Some("founders".into()),
            model_override,
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = InkflowConfig::load(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }
    if let Some(attempts) = cli.max_attempts {
        config.max_attempts_per_stage = attempts;
    }
    logging::init_tracing(cli.verbose, config.log_json);
    let model_override = cli.model.map(ModelTier::from);

    match cli.command {
        Command::Run {
            file,
            generator,
            org,
            out,
            state_dir,
        } => {
            let batch = load_batch(&file)?;
            let request = SubmitRequest {
                generator_type: generator
                    .map(GeneratorType::from)
                    .or(batch.generator_type)
                    .unwrap_or(GeneratorType::MultiAgent),
                organization_id: org
                    .or(batch.organization_id)
                    .unwrap_or_else(|| "default".to_string()),
                items: batch.items,
                settings: JobSettings {
                    model_override: model_override.or(batch.settings.model_override),
                    ..batch.settings
                },
            };

            let queue = build_queue(
                &config,
                job_store(state_dir.as_deref()).await?,
                Arc::new(FileContentStore::new(&out)),
                build_executor(&config)?,
            )?;
            let snapshot = run_to_end(queue, request, config.poll_interval()).await?;
            ui::print_snapshot(&snapshot)?;
        }

        Command::Resume {
            job_id,
            state_dir,
            out,
        } => {
            let queue = build_queue(
                &config,
                job_store(Some(state_dir.as_path())).await?,
                Arc::new(FileContentStore::new(&out)),
                build_executor(&config)?,
            )?;
            let job_id = JobId::from(job_id);
            queue.start();
            let requeued = queue.resume(&job_id).await?;
            info!(job_id = %job_id, requeued, "resuming job");
            let snapshot = follow(&queue, &job_id, config.poll_interval()).await;
            queue.shutdown().await;
            ui::print_snapshot(&snapshot?)?;
        }

        Command::Demo { items } => {
            let items = items.clamp(1, config.max_items_per_job);
            config.base_delay_ms = config.base_delay_ms.min(250);
            let request = demo_request(items, model_override);
            let flaky = request.items.get(1).map(|i| i.topic.clone());

            let mut executor = SimulatedExecutor::new(Duration::from_millis(120))
                .with_pricing(config.pricing.clone());
            if let Some(topic) = flaky {
                executor = executor.fail_times(topic, 0, 2, StageError::provider("529 overloaded"));
            }

            let queue = build_queue(
                &config,
                Arc::new(InMemoryJobStore::new()),
                Arc::new(InMemoryContentStore::new()),
                Arc::new(executor),
            )?;
            let snapshot = run_to_end(queue, request, Duration::from_millis(100)).await?;
            ui::print_snapshot(&snapshot)?;
        }

        Command::Pipeline { generator } => {
            let registry = PipelineRegistry::with_defaults(build_executor(&config)?)?;
            let pipeline = registry.stages_for(generator.into())?;
            ui::print_pipeline(&pipeline);
        }
    }

    Ok(())
}
