//! Engine configuration.
//!
//! Settings are read from environment variables at startup (and on
//! reconfiguration). Malformed values are fatal: the engine refuses to
//! start on a bad configuration rather than running with defaults it was
//! not asked for.

use serde::{Deserialize, Serialize};

/// Configuration errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to parse SCAN_SOURCES: {0}")]
    InvalidScanSources(#[source] serde_json::Error),
}

/// Strictness of LLM prompt sanitization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SanitizationLevel {
    /// Detect and log only.
    Permissive,
    /// Remove overt injection markers.
    #[default]
    Moderate,
    /// Aggressive removal; may affect legitimate content.
    Strict,
}

impl SanitizationLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "permissive" => Some(SanitizationLevel::Permissive),
            "moderate" => Some(SanitizationLevel::Moderate),
            "strict" => Some(SanitizationLevel::Strict),
            _ => None,
        }
    }
}

/// Configuration for one scanner source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerSourceConfig {
    /// Adapter type key (e.g. "wazuh", "mock").
    pub kind: String,
    /// Base API endpoint.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Verify TLS certificates when talking to the scanner.
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

fn default_true() -> bool {
    true
}

/// Engine settings, loaded from the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// LLM adapter to instantiate ("openai" or "anthropic").
    pub llm_provider: String,
    /// Model identifier; provider default when absent.
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    /// NVD API key; lifts the NVD rate limit from 5 to 50 req / 30s.
    pub nvd_api_key: Option<String>,
    pub scan_sources: Vec<ScannerSourceConfig>,
    /// Sandbox CPU limit in cores.
    pub sandbox_cpu_limit: f64,
    /// Sandbox memory limit in megabytes.
    pub sandbox_mem_limit_mb: u64,
    /// Bulkhead size for concurrent enrichment jobs.
    pub enrich_concurrency: usize,
    /// Enrichment cache TTL in hours.
    pub cache_ttl_hours: u64,
    pub sanitization_level: SanitizationLevel,
    /// Default circuit-breaker failure threshold.
    pub circuit_failure_threshold: u32,
    /// Default circuit-breaker recovery timeout in seconds.
    pub circuit_recovery_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm_provider: "openai".to_string(),
            llm_model: None,
            llm_api_key: None,
            nvd_api_key: None,
            scan_sources: Vec::new(),
            sandbox_cpu_limit: 2.0,
            sandbox_mem_limit_mb: 4096,
            enrich_concurrency: 5,
            cache_ttl_hours: 24,
            sanitization_level: SanitizationLevel::Moderate,
            circuit_failure_threshold: 5,
            circuit_recovery_seconds: 60,
        }
    }
}

impl Settings {
    /// Load settings from environment variables, falling back to defaults
    /// for unset keys. Malformed values are errors, not defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Settings::default();

        let scan_sources = match std::env::var("SCAN_SOURCES") {
            Ok(raw) if !raw.trim().is_empty() => {
                serde_json::from_str(&raw).map_err(ConfigError::InvalidScanSources)?
            }
            _ => Vec::new(),
        };

        let sanitization_level = match std::env::var("SANITIZATION_LEVEL") {
            Ok(raw) => SanitizationLevel::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "SANITIZATION_LEVEL".to_string(),
                value: raw,
                reason: "expected permissive, moderate or strict".to_string(),
            })?,
            Err(_) => defaults.sanitization_level,
        };

        Ok(Self {
            llm_provider: std::env::var("LLM_PROVIDER").unwrap_or(defaults.llm_provider),
            llm_model: std::env::var("LLM_MODEL").ok(),
            llm_api_key: std::env::var("LLM_API_KEY").ok(),
            nvd_api_key: std::env::var("NVD_API_KEY").ok(),
            scan_sources,
            sandbox_cpu_limit: parse_env("SANDBOX_CPU_LIMIT", defaults.sandbox_cpu_limit)?,
            sandbox_mem_limit_mb: parse_env("SANDBOX_MEM_LIMIT", defaults.sandbox_mem_limit_mb)?,
            enrich_concurrency: parse_env("ENRICH_CONCURRENCY", defaults.enrich_concurrency)?,
            cache_ttl_hours: parse_env("CACHE_TTL_HOURS", defaults.cache_ttl_hours)?,
            sanitization_level,
            circuit_failure_threshold: parse_env(
                "CIRCUIT_FAILURE_THRESHOLD",
                defaults.circuit_failure_threshold,
            )?,
            circuit_recovery_seconds: parse_env(
                "CIRCUIT_RECOVERY_SECONDS",
                defaults.circuit_recovery_seconds,
            )?,
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
            reason: format!("expected a {}", std::any::type_name::<T>()),
        }),
        Err(_) => Ok(default),
    }
}
