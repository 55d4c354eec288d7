//! OpenAI-style Chat Completions adapter.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use patchforge_resilience::{
    get_circuit_breaker, CircuitBreaker, CircuitBreakerConfig, CircuitError,
};

use crate::client::{ChatMessage, GenerationOptions, LlmClient, LlmResponse};
use crate::error::LlmError;
use crate::providers::LLM_REQUEST_TIMEOUT;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4";

/// Client for the OpenAI Chat Completions API.
#[derive(Debug)]
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl OpenAiClient {
    pub fn new(api_key: &str, model: Option<&str>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(LLM_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            base_url: OPENAI_BASE_URL.to_string(),
            api_key: api_key.to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            client,
            breaker: get_circuit_breaker("llm-openai", CircuitBreakerConfig::default()),
        }
    }

    /// Point the client at a different endpoint (local stubs in tests).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    fn build_payload(&self, messages: &[ChatMessage], options: &GenerationOptions) -> serde_json::Value {
        let chat: Vec<_> = messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut payload = json!({
            "model": self.model,
            "messages": chat,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
        });
        if let Some(top_p) = options.top_p {
            payload["top_p"] = json!(top_p);
        }
        payload
    }

    async fn request(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<LlmResponse, LlmError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.build_payload(messages, options))
            .send()
            .await?;

        let status = response.status();
        match status.as_u16() {
            401 => return Err(LlmError::Authentication("invalid OpenAI API key".to_string())),
            429 => return Err(LlmError::RateLimited("OpenAI rate limit exceeded".to_string())),
            200 => {}
            code => {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Api(format!("OpenAI returned {code}: {body}")));
            }
        }

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Api(format!("malformed OpenAI response: {e}")))?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Api("OpenAI response contained no choices".to_string()))?;

        Ok(LlmResponse {
            content: choice.message.content,
            model: body.model,
            tokens_used: body.usage.total_tokens,
            finish_reason: choice.finish_reason,
            metadata: json!({
                "prompt_tokens": body.usage.prompt_tokens,
                "completion_tokens": body.usage.completion_tokens,
            }),
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<LlmResponse, LlmError> {
        match self.breaker.call(|| self.request(messages, options)).await {
            Ok(response) => Ok(response),
            Err(CircuitError::Open { name, failures }) => Err(LlmError::Api(format!(
                "circuit breaker '{name}' is open after {failures} failures"
            ))),
            Err(CircuitError::Inner(err)) => Err(err),
        }
    }
}
