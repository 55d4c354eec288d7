//! Concrete LLM provider adapters.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

use std::time::Duration;

/// Per-request timeout for LLM backends.
pub(crate) const LLM_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
