use std::future::Future;
use std::time::Duration;

use reqwest::Client;

use super::error::AnthropicError;
use super::types::{MessagesRequest, MessagesResponse};

const API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Anything that can answer a Messages API request.
///
/// Implemented by [`AnthropicClient`] and by test doubles.
pub trait MessageSender: Send + Sync {
    fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> impl Future<Output = Result<MessagesResponse, AnthropicError>> + Send;
}

pub struct AnthropicClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, AnthropicError> {
        Self::with_base_url(api_key, API_URL.to_string(), timeout)
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(
        api_key: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, AnthropicError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url,
        })
    }
}

impl MessageSender for AnthropicClient {
    async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(AnthropicError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AnthropicError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<MessagesResponse>().await?;
        if body.text().trim().is_empty() {
            return Err(AnthropicError::InvalidResponse(format!(
                "response {} contained no text",
                body.id
            )));
        }
        Ok(body)
    }
}
