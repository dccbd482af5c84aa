use async_trait::async_trait;
use tracing::debug;

use super::executor::{PricingTable, StageContext, StageExecutor, StageOutput, TokenUsage};
use super::stage::{StageKind, StageSpec};
use crate::anthropic::{AnthropicError, Message, MessageSender, MessagesRequest};
use crate::error::StageError;

/// Stage executor backed by the Anthropic Messages API.
pub struct LlmStageExecutor<S> {
    sender: S,
    pricing: PricingTable,
    /// Client-side request timeout, reported when the client gives up.
    request_timeout_ms: u64,
}

impl<S: MessageSender> LlmStageExecutor<S> {
    pub fn new(sender: S, pricing: PricingTable) -> Self {
        Self {
            sender,
            pricing,
            request_timeout_ms: 0,
        }
    }

    pub fn with_request_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// Build the system and user prompts for one stage.
pub fn build_prompt(spec: &StageSpec, ctx: &StageContext) -> (String, String) {
    let p = &ctx.params;
    let mut brief = format!(
        "Topic: {}\nCategory: {}\nTarget length: about {} words",
        p.topic, p.category, p.target_word_count
    );
    if !p.keywords.is_empty() {
        brief.push_str(&format!("\nKeywords: {}", p.keywords.join(", ")));
    }
    if let Some(tone) = &ctx.settings.tone {
        brief.push_str(&format!("\nTone: {tone}"));
    }
    if let Some(audience) = &ctx.settings.audience {
        brief.push_str(&format!("\nAudience: {audience}"));
    }

    let system = match spec.kind {
        StageKind::Article => "You are a senior content writer. Write a complete, publish-ready article in Markdown.",
        StageKind::Outline => "You are a content strategist. Produce a structured Markdown outline with headings and key points.",
        StageKind::Draft => "You are a content writer. Expand the outline into a full Markdown draft.",
        StageKind::SeoOptimize => "You are an SEO editor. Work the keywords into headings and body naturally without changing the meaning.",
        StageKind::Edit => "You are a copy editor. Tighten the prose, fix errors and return only the final Markdown article.",
    }
    .to_string();

    let mut user = brief;
    for required in &spec.requires {
        if let Some(out) = ctx.output_of(*required) {
            user.push_str(&format!("\n\n--- {required} ---\n{out}"));
        }
    }
    (system, user)
}

/// Map a client error onto the stage taxonomy. Other 4xx responses mean the
/// request itself was bad and become `Validation`; auth failures stay
/// provider errors and are not retried.
fn classify(err: AnthropicError, ctx: &StageContext, timeout_ms: u64) -> StageError {
    match err {
        AnthropicError::RateLimited { retry_after_ms } => StageError::Provider {
            message: format!("rate limited, retry after {retry_after_ms}ms"),
            status: Some(429),
        },
        AnthropicError::ApiError { status, message } => {
            if matches!(status, 401 | 403 | 408 | 429) || status >= 500 {
                StageError::Provider {
                    message,
                    status: Some(status),
                }
            } else {
                StageError::Validation(format!("provider rejected request ({status}): {message}"))
            }
        }
        AnthropicError::Timeout => StageError::Timeout {
            after_ms: timeout_ms,
        },
        AnthropicError::InvalidResponse(message) => StageError::provider(message),
        AnthropicError::NetworkError(e) => StageError::provider(format!(
            "network error on stage {} attempt {}: {e}",
            ctx.stage_index, ctx.attempt
        )),
    }
}

#[async_trait]
impl<S: MessageSender> StageExecutor for LlmStageExecutor<S> {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn execute(
        &self,
        spec: &StageSpec,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let tier = ctx.tier_for(spec);
        let (system, user) = build_prompt(spec, ctx);
        let req = MessagesRequest {
            model: tier.api_model().to_string(),
            max_tokens: spec.max_tokens,
            system: Some(system),
            temperature: None,
            messages: vec![Message::user(user)],
        };

        debug!(stage = spec.name(), model = %req.model, attempt = ctx.attempt, "sending stage request");
        let response = self
            .sender
            .send_message(&req)
            .await
            .map_err(|e| classify(e, ctx, self.request_timeout_ms))?;

        let tokens_used = TokenUsage::new(
            response.usage.input_tokens.into(),
            response.usage.output_tokens.into(),
        );
        Ok(StageOutput {
            output: response.text(),
            tokens_used,
            cost_usd: self.pricing.rate_for(tier).cost(tokens_used),
        })
    }
}
