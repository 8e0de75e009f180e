//! Proxy configuration: YAML file model, defaults, and validation.

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// When set and non-empty, this variable's value is parsed as the YAML
/// configuration document instead of reading the configured file path.
pub const CONFIG_ENV: &str = "CONFIG";

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:25565";
const DEFAULT_SHUTDOWN_AFTER: Duration = Duration::from_secs(15 * 60);
const DEFAULT_MINECRAFT_PORT: u16 = 25565;

/// Top-level configuration for the proxy.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Address the proxy listens on.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Backends to front, one per virtual hostname.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Configuration for a single fronted backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Virtual hostname clients connect with. Routing is keyed on this
    /// exact string.
    pub hostname: String,

    /// How long the backend may sit at zero connections before the watcher
    /// stops it. Duration string ("15m", "1h30m"); defaults to 15 minutes.
    #[serde(default)]
    pub shutdown_after: Option<String>,

    /// Player names admitted to this backend. Empty admits everyone.
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// The backend Minecraft listener.
    pub minecraft: MinecraftConfig,

    /// Compute Engine instance backing this server. Exactly one of `gcp`
    /// and `docker` must be set.
    #[serde(default)]
    pub gcp: Option<GcpConfig>,

    /// Docker container backing this server.
    #[serde(default)]
    pub docker: Option<DockerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinecraftConfig {
    /// Host the backend server listens on.
    pub hostname: String,

    /// Port of the backend listener.
    #[serde(default = "default_minecraft_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpConfig {
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    pub project: String,
    pub zone: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    #[serde(rename = "containerID")]
    pub container_id: String,
}

impl Config {
    /// Load the configuration, letting the `CONFIG` environment variable
    /// take precedence over the file path when it is set and non-empty.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if let Ok(document) = std::env::var(CONFIG_ENV) {
            if !document.is_empty() {
                return Self::parse(&document)
                    .with_context(|| format!("failed to parse ${CONFIG_ENV}"));
            }
        }

        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse and validate a YAML configuration document.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).context("failed to unmarshal configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration, collecting every problem.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.servers.is_empty() {
            errors.push("no servers defined".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for (i, server) in self.servers.iter().enumerate() {
            if let Err(e) = server.validate(i) {
                errors.push(e);
            }
            if !server.hostname.is_empty() && !seen.insert(server.hostname.as_str()) {
                errors.push(format!("duplicate server hostname {:?}", server.hostname));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

impl ServerConfig {
    /// Idle duration before the watcher stops this backend.
    pub fn shutdown_after(&self) -> anyhow::Result<Duration> {
        match self.shutdown_after.as_deref() {
            None | Some("") => Ok(DEFAULT_SHUTDOWN_AFTER),
            Some(raw) => humantime::parse_duration(raw)
                .with_context(|| format!("invalid shutdownAfter {:?}", raw)),
        }
    }

    fn validate(&self, index: usize) -> Result<(), String> {
        if self.hostname.is_empty() {
            return Err(format!("server {} has no hostname", index));
        }

        match (&self.gcp, &self.docker) {
            (Some(_), Some(_)) => {
                return Err(format!(
                    "server {:?} has both gcp and docker config",
                    self.hostname
                ));
            }
            (None, None) => {
                return Err(format!(
                    "server {:?} has no gcp or docker config",
                    self.hostname
                ));
            }
            _ => {}
        }

        if self.minecraft.hostname.is_empty() {
            return Err(format!(
                "server {:?} has no configured minecraft hostname",
                self.hostname
            ));
        }

        if let Err(e) = self.shutdown_after() {
            return Err(format!("server {:?}: {}", self.hostname, e));
        }

        Ok(())
    }
}

fn default_listen_address() -> String {
    DEFAULT_LISTEN_ADDRESS.to_string()
}

fn default_minecraft_port() -> u16 {
    DEFAULT_MINECRAFT_PORT
}
