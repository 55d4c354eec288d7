//! Provider registry.

use std::sync::Arc;
use tracing::info;

use patchforge_core::{ConfigError, Settings};

use crate::client::LlmClient;
use crate::providers::{AnthropicClient, OpenAiClient};

/// Instantiate the configured LLM client.
///
/// Honors `LLM_PROVIDER`, `LLM_MODEL` and `LLM_API_KEY`. An unknown
/// provider or a missing key is a configuration error, fatal at startup.
pub fn create_client(settings: &Settings) -> Result<Arc<dyn LlmClient>, ConfigError> {
    let api_key = settings
        .llm_api_key
        .as_deref()
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "LLM_API_KEY".to_string(),
            value: String::new(),
            reason: "an API key is required".to_string(),
        })?;

    let model = settings.llm_model.as_deref();

    let client: Arc<dyn LlmClient> = match settings.llm_provider.to_lowercase().as_str() {
        "openai" => Arc::new(OpenAiClient::new(api_key, model)),
        "anthropic" => Arc::new(AnthropicClient::new(api_key, model)),
        other => {
            return Err(ConfigError::InvalidValue {
                key: "LLM_PROVIDER".to_string(),
                value: other.to_string(),
                reason: "expected openai or anthropic".to_string(),
            })
        }
    };

    info!(
        "created {} llm client with model {}",
        settings.llm_provider,
        client.model()
    );
    Ok(client)
}
