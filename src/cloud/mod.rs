//! Cloud lifecycle drivers and the shared types between them.
//!
//! A backend's compute is managed through the [`Provider`] capability set;
//! the configuration's `gcp`/`docker` block selects the driver.

pub mod docker;
pub mod gcp;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Normalized lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudStatus {
    /// Instance is up and able to accept connections.
    Running,
    /// Instance is coming up and cannot be started again.
    Starting,
    /// Instance is going down and cannot be started yet.
    Stopping,
    /// Instance is down and can be started.
    Stopped,
    /// State could not be determined. Usually an error state.
    Unknown,
}

impl fmt::Display for CloudStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloudStatus::Running => "RUNNING",
            CloudStatus::Starting => "STARTING",
            CloudStatus::Stopping => "STOPPING",
            CloudStatus::Stopped => "STOPPED",
            CloudStatus::Unknown => "UNKNOWN",
        })
    }
}

/// Errors surfaced by a provider.
#[derive(Debug, Error)]
pub enum CloudError {
    /// Start was requested but the instance is not in a stopped state.
    /// Callers treat this as "someone else already started it".
    #[error("instance is not stopped")]
    NotStopped,

    /// Stop was requested but the instance is not running.
    #[error("instance is not running")]
    NotRunning,

    /// Anything the underlying provider API reported.
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

/// A cloud provider capable of managing a single instance's lifecycle.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Fetch the instance's current state, normalized per [`CloudStatus`].
    async fn status(&self, instance_id: &str) -> Result<CloudStatus, CloudError>;

    /// Start the instance. Fails with [`CloudError::NotStopped`] when it is
    /// not in a stopped state.
    async fn start(&self, instance_id: &str) -> Result<(), CloudError>;

    /// Stop the instance. Fails with [`CloudError::NotRunning`] when it is
    /// already stopped.
    async fn stop(&self, instance_id: &str) -> Result<(), CloudError>;

    /// Whether the machine this process runs on is scheduled for termination
    /// (preemption). Consumed by the in-instance agent, not the proxy.
    async fn should_terminate(&self) -> Result<bool, CloudError>;
}
