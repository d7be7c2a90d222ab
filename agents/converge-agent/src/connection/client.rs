//! Control Plane Client
//!
//! HTTP client for the control service endpoints the agent consumes.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::cli::config::ControlPlaneConfig;
use crate::connection::protocol::{AppliedConfiguration, DesiredConfiguration, LogChunk};

const CONFIGURATION_PATH: &str = "/blueprint/configuration";
const APPLIED_CONFIGURATION_PATH: &str = "/blueprint/applied_configuration";
const BOOTSTRAP_LOGS_PATH: &str = "/blueprint/bootstrap_logs";

const AGENT_ID_HEADER: &str = "x-agent-id";
const SERVER_ID_HEADER: &str = "x-server-id";

/// Operations the agent consumes from the control service.
///
/// Reporting calls hand back the raw HTTP status so the retry layer can
/// classify it; a transport failure is an `Err`.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch the desired configuration for this host
    async fn fetch_desired_configuration(&self) -> Result<DesiredConfiguration>;

    /// Fetch an artifact by service-relative path into `local_path`
    async fn download_artifact(&self, relative_path: &str, local_path: &Path) -> Result<u16>;

    /// Deliver one chunk of policy output
    async fn submit_log_chunk(&self, chunk: &LogChunk) -> Result<u16>;

    /// Report which revisions were applied in a cycle
    async fn submit_applied_configuration(&self, summary: &AppliedConfiguration) -> Result<u16>;
}

/// reqwest-backed [`ControlPlane`]
#[derive(Debug)]
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
}

impl HttpControlPlane {
    /// Build a client from the control plane section of the agent config.
    ///
    /// Every request carries the agent and server ids.
    pub fn new(config: &ControlPlaneConfig, agent_id: &str, server_id: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .default_headers(default_headers(config, agent_id, server_id)?)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("converge-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Verify the control service answers at all; any HTTP status counts.
    pub async fn check_reachable(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.base_url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", self.base_url))?;
        debug!(status = response.status().as_u16(), "Control plane reachable");
        Ok(())
    }
}

fn default_headers(
    config: &ControlPlaneConfig,
    agent_id: &str,
    server_id: &str,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if let Some(key) = &config.api_key {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", key))
                .context("API key is not a valid header value")?,
        );
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        AGENT_ID_HEADER,
        HeaderValue::from_str(agent_id).context("agent_id is not a valid header value")?,
    );
    headers.insert(
        SERVER_ID_HEADER,
        HeaderValue::from_str(server_id).context("server_id is not a valid header value")?,
    );
    Ok(headers)
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_desired_configuration(&self) -> Result<DesiredConfiguration> {
        let url = self.url(CONFIGURATION_PATH);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Fetching desired configuration failed with status {}", status);
        }

        response
            .json()
            .await
            .context("Failed to decode desired configuration")
    }

    async fn download_artifact(&self, relative_path: &str, local_path: &Path) -> Result<u16> {
        let url = self.url(relative_path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Ok(status.as_u16());
        }

        let mut file = tokio::fs::File::create(local_path)
            .await
            .with_context(|| format!("Failed to create {}", local_path.display()))?;

        let mut body = response.bytes_stream();
        while let Some(piece) = body.next().await {
            let piece = piece.with_context(|| format!("Failed to read body of {}", url))?;
            file.write_all(&piece)
                .await
                .with_context(|| format!("Failed to write {}", local_path.display()))?;
        }
        file.flush().await?;

        debug!(url = %url, path = %local_path.display(), "Artifact downloaded");
        Ok(status.as_u16())
    }

    async fn submit_log_chunk(&self, chunk: &LogChunk) -> Result<u16> {
        let url = self.url(BOOTSTRAP_LOGS_PATH);
        let response = self
            .client
            .post(&url)
            .json(chunk)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        Ok(response.status().as_u16())
    }

    async fn submit_applied_configuration(&self, summary: &AppliedConfiguration) -> Result<u16> {
        let url = self.url(APPLIED_CONFIGURATION_PATH);
        let response = self
            .client
            .put(&url)
            .json(summary)
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        Ok(response.status().as_u16())
    }
}
