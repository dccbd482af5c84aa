//! The stage executor seam and the accounting that flows through it.
//!
//! An executor runs exactly one stage once. It has no view of retries: the
//! item task owns that policy, so executors stay pure with respect to queue
//! state and are easy to replace in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::stage::{ModelTier, StageKind, StageSpec};
use crate::error::StageError;
use crate::job::{ItemInput, JobId, JobSettings};

/// Token counts reported for one or more LLM calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self { prompt, completion }
    }

    pub fn total(&self) -> u64 {
        self.prompt + self.completion
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
    }
}

/// Round a USD amount to six decimal places.
pub fn round_usd(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Price per thousand tokens for one model tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Rate {
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        let input = usage.prompt as f64 / 1000.0 * self.input_per_1k;
        let output = usage.completion as f64 / 1000.0 * self.output_per_1k;
        round_usd(input + output)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    #[serde(default = "default_haiku_rate")]
    pub haiku: Rate,
    #[serde(default = "default_sonnet_rate")]
    pub sonnet: Rate,
    #[serde(default = "default_opus_rate")]
    pub opus: Rate,
}

fn default_haiku_rate() -> Rate {
    Rate {
        input_per_1k: 0.001,
        output_per_1k: 0.005,
    }
}

fn default_sonnet_rate() -> Rate {
    Rate {
        input_per_1k: 0.003,
        output_per_1k: 0.015,
    }
}

fn default_opus_rate() -> Rate {
    Rate {
        input_per_1k: 0.005,
        output_per_1k: 0.025,
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            haiku: default_haiku_rate(),
            sonnet: default_sonnet_rate(),
            opus: default_opus_rate(),
        }
    }
}

impl PricingTable {
    pub fn rate_for(&self, tier: ModelTier) -> Rate {
        match tier {
            ModelTier::Haiku => self.haiku,
            ModelTier::Sonnet => self.sonnet,
            ModelTier::Opus => self.opus,
        }
    }
}

/// Inputs available to a stage: the item's original parameters plus every
/// prior stage output, in pipeline order.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: JobId,
    pub item_index: usize,
    pub stage_index: usize,
    /// 1-based attempt number for this stage.
    pub attempt: u32,
    pub params: ItemInput,
    pub settings: JobSettings,
    pub prior: Vec<(StageKind, String)>,
}

impl StageContext {
    pub fn output_of(&self, kind: StageKind) -> Option<&str> {
        self.prior
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, out)| out.as_str())
    }

    pub fn previous_output(&self) -> Option<&str> {
        self.prior.last().map(|(_, out)| out.as_str())
    }

    /// Resolve the model tier, honoring a job-wide override.
    pub fn tier_for(&self, spec: &StageSpec) -> ModelTier {
        self.settings.model_override.unwrap_or(spec.tier)
    }
}

/// Successful output of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub output: String,
    pub tokens_used: TokenUsage,
    pub cost_usd: f64,
}

/// Runs a single pipeline stage. Implementations must not retry internally.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        spec: &StageSpec,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError>;
}

/// A failure injected by [`SimulatedExecutor`] for a given topic and stage.
#[derive(Debug, Clone)]
struct ScriptedFailure {
    topic: String,
    stage_index: usize,
    times: u32,
    error: StageError,
}

/// Offline executor producing deterministic content.
///
/// Used when no API key is configured and in tests. Failures can be
/// scripted per topic and stage; each scripted failure fires on the first
/// `times` attempts of that stage and then lets the stage succeed.
pub struct SimulatedExecutor {
    latency: Duration,
    pricing: PricingTable,
    failures: Vec<ScriptedFailure>,
    calls: Mutex<HashMap<(String, usize), u32>>,
}

const FILLER: &[&str] = &[
    "practical", "guide", "teams", "results", "insight", "strategy", "readers", "clear",
    "example", "growth", "content", "value",
];

impl SimulatedExecutor {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            pricing: PricingTable::default(),
            failures: Vec::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Fail the first `times` attempts of `stage_index` for `topic`.
    pub fn fail_times(
        mut self,
        topic: impl Into<String>,
        stage_index: usize,
        times: u32,
        error: StageError,
    ) -> Self {
        self.failures.push(ScriptedFailure {
            topic: topic.into(),
            stage_index,
            times,
            error,
        });
        self
    }

    /// Number of calls seen so far for a topic and stage.
    pub fn calls_for(&self, topic: &str, stage_index: usize) -> u32 {
        self.calls
            .lock()
            .get(&(topic.to_string(), stage_index))
            .copied()
            .unwrap_or(0)
    }

    fn compose(spec: &StageSpec, ctx: &StageContext) -> String {
        let topic = ctx.params.topic.trim();
        match spec.kind {
            StageKind::Outline => {
                let mut lines = vec![format!("# {topic}")];
                lines.push("1. Introduction".to_string());
                for (i, kw) in ctx.params.keywords.iter().enumerate() {
                    lines.push(format!("{}. {kw}", i + 2));
                }
                lines.push(format!("{}. Conclusion", ctx.params.keywords.len() + 2));
                lines.join("\n")
            }
            _ => {
                let target = ctx.params.target_word_count as usize;
                let mut words: Vec<&str> = topic.split_whitespace().collect();
                let mut seeds: Vec<&str> = ctx.params.keywords.iter().map(String::as_str).collect();
                seeds.extend_from_slice(FILLER);
                let mut i = 0;
                while words.len() < target {
                    words.push(seeds[i % seeds.len()]);
                    i += 1;
                }
                words.truncate(target.max(1));
                format!("# {topic}\n\n{}", words.join(" "))
            }
        }
    }
}

#[async_trait]
impl StageExecutor for SimulatedExecutor {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn execute(
        &self,
        spec: &StageSpec,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let call = {
            let mut calls = self.calls.lock();
            let entry = calls
                .entry((ctx.params.topic.clone(), ctx.stage_index))
                .or_insert(0);
            *entry += 1;
            *entry
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(failure) = self
            .failures
            .iter()
            .find(|f| f.topic == ctx.params.topic && f.stage_index == ctx.stage_index)
            && call <= failure.times
        {
            return Err(failure.error.clone());
        }

        let output = Self::compose(spec, ctx);
        let prompt_words = ctx.prior.iter().map(|(_, o)| o.split_whitespace().count()).sum::<usize>()
            + ctx.params.topic.split_whitespace().count()
            + 40;
        let tokens_used = TokenUsage::new(
            (prompt_words as u64 * 4).div_ceil(3),
            (output.split_whitespace().count() as u64 * 4).div_ceil(3),
        );
        let cost_usd = self.pricing.rate_for(ctx.tier_for(spec)).cost(tokens_used);

        Ok(StageOutput {
            output,
            tokens_used,
            cost_usd,
        })
    }
}
