pub mod docker;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("image registry unreachable: {0}")]
    RegistryUnreachable(String),

    #[error("registry authentication required: {0}")]
    AuthRequired(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    /// Whether retrying the same call may succeed without operator action.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Unavailable(_)
                | RuntimeError::RegistryUnreachable(_)
                | RuntimeError::Timeout(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Container status as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Removing,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// Parse a daemon state string; anything unrecognised maps to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "exited" => ContainerStatus::Exited,
            "removing" => ContainerStatus::Removing,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One published port mapping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PortMapping {
    pub protocol: String,
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
}

/// One bind or volume mount.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, utoipa::ToSchema)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Lightweight entry returned by `list`.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub status: ContainerStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
}

/// Full detail returned by `inspect`. `env` is `None` when the daemon did
/// not yield the container's configuration; such a container cannot be
/// safely recreated.
#[derive(Debug, Clone)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    /// Image ID the container is currently running.
    pub image_digest: Option<String>,
    pub status: ContainerStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
    pub env: Option<Vec<String>>,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<MountSpec>,
}

/// Everything needed to create a replacement container.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub image_ref: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<MountSpec>,
}

/// Result of a `list` call. Entries the daemon returned in a malformed or
/// partial state are reported as diagnostics rather than failing the listing.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub containers: Vec<ContainerSummary>,
    pub diagnostics: Vec<String>,
}

/// Lightweight image info returned by `image_list`.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: i64,
    pub created: i64,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The sole path to the container daemon. All methods are safe to invoke
/// from multiple concurrent callers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Socket or pipe path used to reach the daemon.
    fn endpoint(&self) -> String;

    /// Daemon reachability check.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// List all containers, tolerating per-entry failures.
    async fn list(&self) -> Result<Listing, RuntimeError>;

    /// Full detail for one container. `NotFound` if it disappeared.
    async fn inspect(&self, id: &str) -> Result<ContainerDetail, RuntimeError>;

    /// Pull `image_ref` from its registry and return the image ID the ref
    /// now resolves to locally (which may equal the previous one).
    async fn pull(&self, image_ref: &str) -> Result<Option<String>, RuntimeError>;

    /// Stop with a cooperative timeout, then force. Idempotent on stopped.
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Start a stopped container. Idempotent on running.
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Create a container from a recreation spec. Returns the new id.
    async fn create(&self, spec: CreateSpec) -> Result<String, RuntimeError>;

    /// Rename a container (frees its name for a replacement).
    async fn rename(&self, id: &str, name: &str) -> Result<(), RuntimeError>;

    /// Remove a container. Idempotent on missing.
    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Remove an image. The caller treats failures as best-effort.
    async fn image_remove(&self, image: &str) -> Result<(), RuntimeError>;

    /// List local images.
    async fn image_list(&self) -> Result<Vec<ImageInfo>, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_roundtrip() {
        for s in [
            "created",
            "running",
            "paused",
            "restarting",
            "exited",
            "removing",
            "dead",
        ] {
            assert_eq!(ContainerStatus::parse(s).to_string(), s);
        }
        assert_eq!(ContainerStatus::parse("weird"), ContainerStatus::Unknown);
        assert_eq!(ContainerStatus::parse("RUNNING"), ContainerStatus::Running);
    }

    #[test]
    fn retryable_errors() {
        assert!(RuntimeError::Unavailable("x".into()).retryable());
        assert!(RuntimeError::RegistryUnreachable("x".into()).retryable());
        assert!(RuntimeError::Timeout("x".into()).retryable());
        assert!(!RuntimeError::NotFound("x".into()).retryable());
        assert!(!RuntimeError::AuthRequired("x".into()).retryable());
    }
}
