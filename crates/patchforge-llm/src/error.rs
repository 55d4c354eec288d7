//! LLM error taxonomy.

/// Errors raised by LLM clients.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Invalid or missing credentials; never retried.
    #[error("llm authentication failed: {0}")]
    Authentication(String),

    #[error("llm rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("llm request timed out: {0}")]
    Timeout(String),

    /// Transport failures and non-success API responses.
    #[error("llm error: {0}")]
    Api(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else {
            LlmError::Api(err.to_string())
        }
    }
}
