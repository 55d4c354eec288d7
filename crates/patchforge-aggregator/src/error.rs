//! Error taxonomy for ingestion and enrichment.

/// Scanner adapter errors.
///
/// Scanner failures are isolated per source: a scan cycle logs the error
/// and continues with the remaining scanners.
#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    /// Authentication failed; never retried.
    #[error("authentication failed for {scanner}: {reason}")]
    Authentication { scanner: String, reason: String },

    /// Transport or parse failure while fetching findings.
    #[error("fetch failed for {scanner}: {reason}")]
    Fetch { scanner: String, reason: String },

    #[error("asset not found: {0}")]
    AssetNotFound(String),
}

impl ScannerError {
    pub fn auth(scanner: &str, reason: impl std::fmt::Display) -> Self {
        ScannerError::Authentication {
            scanner: scanner.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn fetch(scanner: &str, reason: impl std::fmt::Display) -> Self {
        ScannerError::Fetch {
            scanner: scanner.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Enrichment client errors.
///
/// Enrichment failures degrade gracefully: the pipeline emits the
/// unenriched finding rather than dropping the record.
#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("rate limit exceeded for {service}")]
    RateLimited { service: String },

    #[error("{service} returned status {status}")]
    Api { service: String, status: u16 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("bulkhead rejected enrichment: {0}")]
    BulkheadRejected(#[from] patchforge_resilience::BulkheadRejected),
}

impl EnrichError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EnrichError::Http(_) | EnrichError::Timeout(_) | EnrichError::Api { status: 500..=599, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scanner_error_display() {
        let err = ScannerError::auth("Wazuh", "bad credentials");
        assert!(err.to_string().contains("Wazuh"));
        assert!(err.to_string().contains("authentication failed"));

        let err = ScannerError::fetch("Wazuh", "connection refused");
        assert!(err.to_string().contains("fetch failed"));
    }

    #[test]
    fn test_enrich_error_retryability() {
        assert!(EnrichError::Timeout(std::time::Duration::from_secs(30)).is_retryable());
        assert!(EnrichError::Api {
            service: "nvd".to_string(),
            status: 503
        }
        .is_retryable());
        assert!(!EnrichError::Api {
            service: "nvd".to_string(),
            status: 403
        }
        .is_retryable());
        assert!(!EnrichError::RateLimited {
            service: "nvd".to_string()
        }
        .is_retryable());
        assert!(!EnrichError::CircuitOpen("nvd-api".to_string()).is_retryable());
    }
}
