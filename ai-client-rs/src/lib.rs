// ai-client-rs/src/lib.rs
//
// HTTP clients for the model-serving collaborators (OpenAI-compatible
// chat completions + a local embedding endpoint).
//
// This crate deliberately carries no retry loop: the job queue owns the
// retry policy, and a transport failure here must abort the current
// pipeline step only. Errors are still classified so callers can log
// them meaningfully.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use config_rs::AiConfig;

/// One chat message in provider wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    content: &'a str,
    encoding_format: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

/// Error type for model-serving calls, split so callers can tell a
/// transport problem from a malformed payload.
#[derive(Debug, thiserror::Error)]
pub enum AiClientError {
    #[error("network error: {0}")]
    Network(String),

    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("empty response from model")]
    EmptyResponse,
}

impl AiClientError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AiClientError::Network(format!("request timed out: {}", err))
        } else if err.is_connect() {
            AiClientError::Network(format!("connection failed: {}", err))
        } else {
            AiClientError::Network(format!("network error: {}", err))
        }
    }
}

/// Text-generation collaborator seam; the pipeline and memory writer
/// depend on this trait so tests can substitute a canned model.
#[async_trait]
pub trait TextGeneration: Send + Sync {
    /// One blocking chat call; returns the first choice's content.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AiClientError>;
}

/// Embedding collaborator seam; one call per chunk.
#[async_trait]
pub trait EmbeddingGeneration: Send + Sync {
    async fn embed(&self, content: &str) -> Result<Vec<f32>, AiClientError>;
}

/// Concrete client speaking to the deployed model-serving processes.
#[derive(Debug, Clone)]
pub struct AiClient {
    client: Client,
    service_url: String,
    model_name: String,
    embedding_url: String,
    embedding_model: String,
}

impl AiClient {
    pub fn new(cfg: &AiConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_default();

        Self {
            client,
            service_url: cfg.service_url.clone(),
            model_name: cfg.model_name.clone(),
            embedding_url: cfg.embedding_url.clone(),
            embedding_model: cfg.embedding_model.clone(),
        }
    }
}

#[async_trait]
impl TextGeneration for AiClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AiClientError> {
        let url = format!("{}/v1/chat/completions", self.service_url);
        let body = ChatCompletionRequest {
            model: &self.model_name,
            messages,
        };

        tracing::info!(
            model = %self.model_name,
            message_count = messages.len(),
            "sending chat completion request"
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(AiClientError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "chat completion request failed");
            return Err(AiClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| AiClientError::Parse(format!("failed to parse chat response: {}", e)))?;

        match parsed.choices.into_iter().next() {
            Some(choice) => Ok(choice.message.content),
            None => Err(AiClientError::EmptyResponse),
        }
    }
}

#[async_trait]
impl EmbeddingGeneration for AiClient {
    async fn embed(&self, content: &str) -> Result<Vec<f32>, AiClientError> {
        let url = format!("{}/embedding", self.embedding_url);
        let body = EmbeddingRequest {
            content,
            encoding_format: "float",
            model: &self.embedding_model,
        };

        tracing::debug!(
            model = %self.embedding_model,
            content_len = content.len(),
            "sending embedding request"
        );

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(AiClientError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AiClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let rows: Vec<EmbeddingRow> = response
            .json()
            .await
            .map_err(|e| AiClientError::Parse(format!("failed to parse embedding response: {}", e)))?;

        match rows.into_iter().next() {
            Some(row) if !row.embedding.is_empty() => Ok(row.embedding),
            _ => Err(AiClientError::EmptyResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_helpers_set_roles() {
        let sys = ChatMessage::system("be terse");
        let user = ChatMessage::user("hello");
        assert_eq!(sys.role, "system");
        assert_eq!(user.role, "user");
        assert_eq!(user.content, "hello");
    }

    #[test]
    fn chat_request_serializes_provider_shape() {
        let messages = vec![ChatMessage::user("hi")];
        let req = ChatCompletionRequest {
            model: "test-model",
            messages: &messages,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["model"], "test-model");
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn chat_response_parses_first_choice() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"fixed"}}]}"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].message.content, "fixed");
    }

    #[test]
    fn embedding_response_parses_rows() {
        let raw = r#"[{"embedding":[0.1,0.2,0.3]}]"#;
        let rows: Vec<EmbeddingRow> = serde_json::from_str(raw).unwrap();
        assert_eq!(rows[0].embedding.len(), 3);
    }
}
