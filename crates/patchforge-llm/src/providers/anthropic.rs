//! Anthropic-style Messages adapter.
//!
//! The Messages API takes the system prompt as a separate top-level
//! field rather than a message in the conversation array; the hoisting
//! happens here, inside the adapter, so the orchestrator never has to
//! care which provider it is talking to.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use patchforge_resilience::{
    get_circuit_breaker, CircuitBreaker, CircuitBreakerConfig, CircuitError,
};

use crate::client::{ChatMessage, GenerationOptions, LlmClient, LlmResponse, Role};
use crate::error::LlmError;
use crate::providers::LLM_REQUEST_TIMEOUT;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";

/// Client for the Anthropic Messages API.
#[derive(Debug)]
pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl AnthropicClient {
    pub fn new(api_key: &str, model: Option<&str>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(LLM_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            base_url: ANTHROPIC_BASE_URL.to_string(),
            api_key: api_key.to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            client,
            breaker: get_circuit_breaker("llm-anthropic", CircuitBreakerConfig::default()),
        }
    }

    /// Point the client at a different endpoint (local stubs in tests).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    /// Build the request payload, hoisting the system message out of the
    /// conversation array.
    fn build_payload(&self, messages: &[ChatMessage], options: &GenerationOptions) -> serde_json::Value {
        let mut system: Option<&str> = None;
        let mut conversation = Vec::new();

        for message in messages {
            match message.role {
                Role::System => system = Some(&message.content),
                _ => conversation.push(json!({
                    "role": message.role.as_str(),
                    "content": message.content,
                })),
            }
        }

        let mut payload = json!({
            "model": self.model,
            "messages": conversation,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });
        if let Some(system) = system {
            payload["system"] = json!(system);
        }
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
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.build_payload(messages, options))
            .send()
            .await?;

        let status = response.status();
        match status.as_u16() {
            401 => {
                return Err(LlmError::Authentication(
                    "invalid Anthropic API key".to_string(),
                ))
            }
            429 => {
                return Err(LlmError::RateLimited(
                    "Anthropic rate limit exceeded".to_string(),
                ))
            }
            200 => {}
            code => {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Api(format!("Anthropic returned {code}: {body}")));
            }
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Api(format!("malformed Anthropic response: {e}")))?;

        let content = body
            .content
            .into_iter()
            .next()
            .map(|block| block.text)
            .ok_or_else(|| LlmError::Api("Anthropic response contained no content".to_string()))?;

        Ok(LlmResponse {
            content,
            model: body.model,
            tokens_used: body.usage.input_tokens + body.usage.output_tokens,
            finish_reason: body.stop_reason,
            metadata: json!({
                "input_tokens": body.usage.input_tokens,
                "output_tokens": body.usage.output_tokens,
            }),
        })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_message_is_hoisted() {
        let client = AnthropicClient::new("sk-ant-test", None);
        let messages = [
            ChatMessage::system("You are a Linux administrator."),
            ChatMessage::user("Fix CVE-2024-0001"),
            ChatMessage::assistant("Here is a script"),
        ];
        let payload = client.build_payload(&messages, &GenerationOptions::default());

        assert_eq!(payload["system"], "You are a Linux administrator.");
        let conversation = payload["messages"].as_array().unwrap();
        assert_eq!(conversation.len(), 2, "system message must not stay inline");
        assert_eq!(conversation[0]["role"], "user");
        assert_eq!(conversation[1]["role"], "assistant");
    }

    #[test]
    fn test_payload_without_system_message() {
        let client = AnthropicClient::new("sk-ant-test", None);
        let payload =
            client.build_payload(&[ChatMessage::user("hello")], &GenerationOptions::default());
        assert!(payload.get("system").is_none());
    }

    #[test]
    fn test_default_model() {
        let client = AnthropicClient::new("sk-ant-test", None);
        assert_eq!(client.model(), DEFAULT_MODEL);
    }

    #[test]
    fn test_response_parsing_sums_token_usage() {
        let body: MessagesResponse = serde_json::from_value(serde_json::json!({
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "#!/bin/bash\necho hi"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 80, "output_tokens": 40}
        }))
        .unwrap();

        assert_eq!(body.content[0].text, "#!/bin/bash\necho hi");
        assert_eq!(body.usage.input_tokens + body.usage.output_tokens, 120);
    }
}
