//! Tipos de erro para o cliente da API Anthropic.
//!
//! Define [`AnthropicError`] com variantes para rate limiting, erros da API,
//! timeouts, respostas malformadas e erros de rede.

use thiserror::Error;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429 (rate limit).
    /// O campo `retry_after_ms` indica quantos milissegundos esperar antes de retentar.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro retornado pela API (ex.: 401 chave inválida, 500 erro interno).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// A requisição excedeu o timeout do cliente HTTP.
    #[error("request timed out")]
    Timeout,

    /// A resposta chegou, mas não contém texto utilizável.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Falha de rede subjacente (DNS, conexão recusada).
    #[error("network error: {0}")]
    NetworkError(reqwest::Error),
}

impl From<reqwest::Error> for AnthropicError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnthropicError::Timeout
        } else if err.is_decode() {
            AnthropicError::InvalidResponse(err.to_string())
        } else {
            AnthropicError::NetworkError(err)
        }
    }
}
