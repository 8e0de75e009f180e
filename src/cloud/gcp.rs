//! Compute Engine driver for VM-backed servers.
//!
//! Talks to the Compute Engine REST API directly. Credentials come from
//! `GOOGLE_ACCESS_TOKEN` when set, otherwise from the instance metadata
//! server (the proxy is expected to run inside the project when no explicit
//! token is provided).

use super::{CloudError, CloudStatus, Provider};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::{Duration, Instant};

const COMPUTE_API: &str = "https://compute.googleapis.com/compute/v1";
const METADATA_API: &str = "http://metadata.google.internal/computeMetadata/v1";

/// Tokens are refreshed this long before the metadata server's expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Compute Engine client scoped to one project and zone.
pub struct GcpClient {
    http: reqwest::Client,
    project: String,
    zone: String,
    token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct Instance {
    status: String,
}

/// Normalize a Compute Engine instance state.
///
/// `TERMINATED` is how the API reports a stopped VM; `STAGING` and
/// `PROVISIONING` precede `RUNNING` during boot.
fn normalize_status(raw: &str) -> CloudStatus {
    match raw {
        "RUNNING" => CloudStatus::Running,
        "STARTING" | "STAGING" | "PROVISIONING" => CloudStatus::Starting,
        "STOPPING" => CloudStatus::Stopping,
        "STOPPED" | "TERMINATED" => CloudStatus::Stopped,
        _ => CloudStatus::Unknown,
    }
}

fn is_stopped_state(raw: &str) -> bool {
    raw == "STOPPED" || raw == "TERMINATED"
}

impl GcpClient {
    pub fn new(project: &str, zone: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            project: project.to_string(),
            zone: zone.to_string(),
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, CloudError> {
        if let Ok(token) = std::env::var("GOOGLE_ACCESS_TOKEN") {
            if !token.is_empty() {
                return Ok(token);
            }
        }

        if let Some(cached) = self.token.lock().as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.value.clone());
            }
        }

        let token: MetadataToken = self
            .http
            .get(format!(
                "{METADATA_API}/instance/service-accounts/default/token"
            ))
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(anyhow::Error::from)?
            .error_for_status()
            .map_err(anyhow::Error::from)?
            .json()
            .await
            .map_err(anyhow::Error::from)?;

        let expires_at = Instant::now()
            + Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        let value = token.access_token.clone();
        *self.token.lock() = Some(CachedToken {
            value: token.access_token,
            expires_at,
        });

        Ok(value)
    }

    fn instance_url(&self, instance_id: &str) -> String {
        format!(
            "{COMPUTE_API}/projects/{}/zones/{}/instances/{}",
            self.project, self.zone, instance_id
        )
    }

    /// Fetch the raw (un-normalized) instance state.
    async fn instance_state(&self, instance_id: &str) -> Result<String, CloudError> {
        let token = self.access_token().await?;
        let instance: Instance = self
            .http
            .get(self.instance_url(instance_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(anyhow::Error::from)?
            .error_for_status()
            .map_err(anyhow::Error::from)?
            .json()
            .await
            .map_err(anyhow::Error::from)?;

        Ok(instance.status)
    }

    async fn post_operation(&self, instance_id: &str, verb: &str) -> Result<(), CloudError> {
        let token = self.access_token().await?;
        self.http
            .post(format!("{}/{verb}", self.instance_url(instance_id)))
            .bearer_auth(token)
            .send()
            .await
            .map_err(anyhow::Error::from)?
            .error_for_status()
            .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

#[async_trait]
impl Provider for GcpClient {
    async fn status(&self, instance_id: &str) -> Result<CloudStatus, CloudError> {
        let raw = self.instance_state(instance_id).await?;
        Ok(normalize_status(&raw))
    }

    async fn start(&self, instance_id: &str) -> Result<(), CloudError> {
        let raw = self.instance_state(instance_id).await?;
        if !is_stopped_state(&raw) {
            return Err(CloudError::NotStopped);
        }
        self.post_operation(instance_id, "start").await
    }

    async fn stop(&self, instance_id: &str) -> Result<(), CloudError> {
        let raw = self.instance_state(instance_id).await?;
        if is_stopped_state(&raw) {
            return Err(CloudError::NotRunning);
        }
        self.post_operation(instance_id, "stop").await
    }

    async fn should_terminate(&self) -> Result<bool, CloudError> {
        let preempted = self
            .http
            .get(format!("{METADATA_API}/instance/preempted"))
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(anyhow::Error::from)?
            .error_for_status()
            .map_err(anyhow::Error::from)?
            .text()
            .await
            .map_err(anyhow::Error::from)?;

        Ok(preempted.trim().eq_ignore_ascii_case("TRUE"))
    }
}
