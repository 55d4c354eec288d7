//! Wazuh scanner adapter.
//!
//! Authenticates against the Wazuh manager with basic auth to obtain a
//! bearer token, then pages through the vulnerability list endpoint.
//! The token is held behind a mutex so concurrent fetches never race a
//! refresh.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use patchforge_core::{RawFinding, ScannerSourceConfig, Severity};

use crate::adapter::ScannerAdapter;
use crate::error::ScannerError;

const SCANNER_NAME: &str = "Wazuh";
const PAGE_LIMIT: usize = 1000;
/// Manager tokens expire after 15 minutes; refresh a little earlier.
const TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

/// Adapter for the Wazuh vulnerability detection API.
pub struct WazuhAdapter {
    config: ScannerSourceConfig,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    issued_at: std::time::Instant,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    data: AuthData,
}

#[derive(Debug, Deserialize)]
struct AuthData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: ListData,
}

#[derive(Debug, Deserialize, Default)]
struct ListData {
    #[serde(default)]
    affected_items: Vec<serde_json::Value>,
    #[serde(default)]
    total_affected_items: usize,
}

impl WazuhAdapter {
    pub fn new(config: ScannerSourceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .unwrap_or_default();

        Self {
            config,
            client,
            token: Mutex::new(None),
        }
    }

    /// Return the cached token, authenticating when absent or stale.
    /// The mutex serializes refreshes across concurrent callers.
    async fn ensure_token(&self) -> Result<String, ScannerError> {
        let mut token = self.token.lock().await;
        if let Some(existing) = token.as_ref() {
            if existing.issued_at.elapsed() < TOKEN_TTL {
                return Ok(existing.value.clone());
            }
        }

        let fresh = self.request_token().await?;
        *token = Some(CachedToken {
            value: fresh.clone(),
            issued_at: std::time::Instant::now(),
        });
        Ok(fresh)
    }

    async fn request_token(&self) -> Result<String, ScannerError> {
        let url = format!("{}/security/user/authenticate", self.config.endpoint);
        let username = self.config.username.as_deref().unwrap_or_default();
        let password = self.config.password.as_deref();

        let response = self
            .client
            .post(&url)
            .basic_auth(username, password)
            .send()
            .await
            .map_err(|e| ScannerError::auth(SCANNER_NAME, e))?;

        if !response.status().is_success() {
            return Err(ScannerError::auth(
                SCANNER_NAME,
                format!("status {}", response.status()),
            ));
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| ScannerError::auth(SCANNER_NAME, e))?;

        info!("wazuh authentication succeeded");
        Ok(auth.data.token)
    }

    /// Parse one Wazuh vulnerability item into a raw finding.
    fn parse_item(&self, item: &serde_json::Value) -> RawFinding {
        let cve_id = item
            .get("cve")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let package = item.get("package").cloned().unwrap_or_default();
        let package_name = package
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let package_version = package
            .get("version")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let fixed_version = package
            .get("fixed_version")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let cvss3 = item
            .get("cvss")
            .and_then(|c| c.get("cvss3"))
            .cloned()
            .unwrap_or_default();
        let cvss_score = cvss3.get("base_score").and_then(|v| v.as_f64());
        let cvss_vector = cvss3
            .get("vector_string")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let mut affected_assets = BTreeSet::new();
        if let Some(agent) = item.get("agent_id").and_then(|v| v.as_str()) {
            affected_assets.insert(agent.to_string());
        }

        let discovered_at = item
            .get("detection_time")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let severity_raw = item
            .get("severity")
            .and_then(|v| v.as_str())
            .unwrap_or("medium");

        let title = item
            .get("title")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                format!(
                    "Vulnerability in {}",
                    package_name.as_deref().unwrap_or("unknown package")
                )
            });

        RawFinding {
            scanner_id: format!(
                "wazuh-{}-{}",
                cve_id.as_deref().unwrap_or("nocve"),
                package_name.as_deref().unwrap_or("nopkg")
            ),
            scanner_name: SCANNER_NAME.to_string(),
            cve_id,
            title,
            description: item
                .get("description")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            severity: self.normalize_severity(severity_raw),
            cvss_score,
            cvss_vector,
            affected_package: package_name,
            vulnerable_version: package_version,
            fixed_version,
            affected_assets,
            discovered_at,
            raw_data: item.clone(),
        }
    }
}

#[async_trait]
impl ScannerAdapter for WazuhAdapter {
    fn name(&self) -> &str {
        SCANNER_NAME
    }

    async fn authenticate(&self) -> Result<(), ScannerError> {
        self.ensure_token().await.map(|_| ())
    }

    async fn fetch_findings(
        &self,
        since: Option<DateTime<Utc>>,
        severity_filter: Option<&[Severity]>,
    ) -> Result<Vec<RawFinding>, ScannerError> {
        let token = self.ensure_token().await?;
        let url = format!("{}/vulnerability", self.config.endpoint);

        let mut findings = Vec::new();
        let mut offset = 0usize;

        loop {
            let response = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .query(&[("limit", PAGE_LIMIT.to_string()), ("offset", offset.to_string())])
                .send()
                .await
                .map_err(|e| ScannerError::fetch(SCANNER_NAME, e))?;

            if !response.status().is_success() {
                return Err(ScannerError::fetch(
                    SCANNER_NAME,
                    format!("status {}", response.status()),
                ));
            }

            let page: ListResponse = response
                .json()
                .await
                .map_err(|e| ScannerError::fetch(SCANNER_NAME, e))?;

            let page_len = page.data.affected_items.len();
            for item in &page.data.affected_items {
                let finding = self.parse_item(item);

                // Client-side filters; the list endpoint has no
                // since/severity parameters.
                if let Some(since) = since {
                    if finding.discovered_at < since {
                        continue;
                    }
                }
                if let Some(filter) = severity_filter {
                    if !filter.contains(&finding.severity) {
                        continue;
                    }
                }

                findings.push(finding);
            }

            offset += page_len;
            if page_len < PAGE_LIMIT || offset >= page.data.total_affected_items {
                break;
            }
        }

        info!("wazuh fetch returned {} finding(s)", findings.len());
        Ok(findings)
    }

    async fn get_asset_details(&self, asset_id: &str) -> Result<serde_json::Value, ScannerError> {
        let token = self.ensure_token().await?;
        let url = format!("{}/agents/{}", self.config.endpoint, asset_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(|e| ScannerError::fetch(SCANNER_NAME, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ScannerError::AssetNotFound(asset_id.to_string()));
        }
        if !response.status().is_success() {
            warn!("wazuh agent lookup failed with status {}", response.status());
            return Err(ScannerError::fetch(
                SCANNER_NAME,
                format!("status {}", response.status()),
            ));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ScannerError::fetch(SCANNER_NAME, e))?;

        body.pointer("/data/affected_items/0")
            .cloned()
            .ok_or_else(|| ScannerError::AssetNotFound(asset_id.to_string()))
    }
}
