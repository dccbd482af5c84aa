//! Tipos de dados para requisições e respostas da API Anthropic Messages.
//!
//! Todas as structs derivam `Serialize` e `Deserialize` para conversão JSON
//! conforme o formato esperado pelo endpoint `v1/messages`.

use serde::{Deserialize, Serialize};

/// Corpo da requisição para o endpoint `/v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    /// Identificador do modelo (ex.: "claude-sonnet-4-5-20250929").
    pub model: String,
    /// Número máximo de tokens na resposta.
    pub max_tokens: u32,
    /// Instrução de sistema opcional, omitida do JSON quando ausente.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Mensagens que compõem a conversa.
    pub messages: Vec<Message>,
}

/// Uma única mensagem em uma conversa.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Papel do remetente: "user" ou "assistant".
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Resposta retornada pelo endpoint `/v1/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    /// Blocos de conteúdo na resposta (normalmente texto).
    pub content: Vec<ContentBlock>,
    pub model: String,
    /// Motivo da parada da geração (ex.: "end_turn", "max_tokens").
    pub stop_reason: Option<String>,
    /// Estatísticas de uso de tokens (entrada e saída).
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatena todos os blocos de texto da resposta.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.content_type == "text")
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Um bloco de conteúdo dentro da resposta.
///
/// O campo `content_type` é serializado como `"type"` no JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

/// Estatísticas de consumo de tokens para uma chamada à API.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
