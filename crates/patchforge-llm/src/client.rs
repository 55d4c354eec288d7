//! Provider-abstracted chat client.
//!
//! [`LlmClient`] is the seam between the orchestrator and concrete LLM
//! backends. `generate_with_retry` layers exponential backoff on top of
//! `generate`, with per-error-kind wait schedules: rate limits wait
//! 5/10/20s, timeouts 2/4/8s, generic errors 1/2/4s. Authentication
//! failures are never retried.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::LlmError;

/// Message role in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Generation knobs passed through to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: Option<f64>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
            top_p: None,
        }
    }
}

impl GenerationOptions {
    /// Low-temperature preset for script generation.
    pub fn deterministic(max_tokens: u32) -> Self {
        Self {
            temperature: 0.2,
            max_tokens,
            top_p: None,
        }
    }
}

/// Response from a chat completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    /// Model identifier the provider reports having used.
    pub model: String,
    pub tokens_used: u32,
    pub finish_reason: Option<String>,
    pub metadata: serde_json::Value,
}

/// Chat-style LLM backend.
#[async_trait]
pub trait LlmClient: Send + Sync + std::fmt::Debug {
    /// The configured model identifier.
    fn model(&self) -> &str;

    /// One generation call.
    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<LlmResponse, LlmError>;

    /// Generate with retry. Wait schedules are per error kind; an
    /// authentication error surfaces immediately.
    async fn generate_with_retry(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
        max_retries: u32,
    ) -> Result<LlmResponse, LlmError> {
        let mut last_error = None;

        for attempt in 0..max_retries {
            match self.generate(messages, options).await {
                Ok(response) => return Ok(response),
                Err(err @ LlmError::Authentication(_)) => return Err(err),
                Err(err) => {
                    let base = match &err {
                        LlmError::RateLimited(_) => 5,
                        LlmError::Timeout(_) => 2,
                        _ => 1,
                    };
                    let wait = Duration::from_secs(base * 2u64.pow(attempt));
                    warn!(
                        "llm generation failed (attempt {}/{}), retrying in {}s: {}",
                        attempt + 1,
                        max_retries,
                        wait.as_secs(),
                        err
                    );
                    last_error = Some(err);
                    tokio::time::sleep(wait).await;
                }
            }
        }

        match self.generate(messages, options).await {
            Ok(response) => Ok(response),
            Err(err @ LlmError::Authentication(_)) => Err(err),
            Err(err) => {
                warn!("llm generation failed after {} retries", max_retries);
                Err(last_error.unwrap_or(err))
            }
        }
    }
}
