use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Shared handle to the live configuration. Writers hold the lock only to
/// swap the value; readers clone what they need.
pub type SharedConfig = Arc<RwLock<AgentConfig>>;

// ---------------------------------------------------------------------------
// Label filter
// ---------------------------------------------------------------------------

/// Restricts monitoring to containers carrying a label, optionally with a
/// specific value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct LabelFilter {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl LabelFilter {
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        match labels.get(&self.key) {
            Some(v) => self.value.as_deref().map_or(true, |want| want == v),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent configuration
// ---------------------------------------------------------------------------

/// Runtime configuration of the agent. Intervals serialize as whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct AgentConfig {
    /// How often the monitor loop reconciles against the runtime.
    #[serde(with = "duration_secs")]
    #[schema(value_type = u64)]
    pub check_interval: Duration,

    /// How often the update engine scans for new image digests.
    #[serde(with = "duration_secs")]
    #[schema(value_type = u64)]
    pub update_interval: Duration,

    /// Apply available updates without an operator command.
    pub auto_update: bool,

    /// Remove the replaced image after a successful update.
    pub cleanup: bool,

    /// Only containers matching this label predicate are monitored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_filter: Option<LabelFilter>,

    /// Ring capacity for the in-memory event history.
    pub event_buffer_size: usize,

    /// Fleet-wide cap on concurrently running apply procedures.
    pub max_parallel_updates: usize,

    /// FIFO cap on retained update records.
    pub update_history_size: usize,

    /// Cooperative stop timeout before the runtime forces termination.
    #[serde(with = "duration_secs")]
    #[schema(value_type = u64)]
    pub stop_grace: Duration,

    /// Hard ceiling on one apply procedure.
    #[serde(with = "duration_secs")]
    #[schema(value_type = u64)]
    pub apply_timeout: Duration,

    /// How long a replacement container may take to reach `running`.
    #[serde(with = "duration_secs")]
    #[schema(value_type = u64)]
    pub start_timeout: Duration,

    /// Deadline for draining in-flight HTTP requests on shutdown.
    #[serde(with = "duration_secs")]
    #[schema(value_type = u64)]
    pub drain_timeout: Duration,

    /// HTTP listen port.
    pub port: u16,

    /// Container daemon endpoint override (UNIX socket path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_endpoint: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            update_interval: Duration::from_secs(300),
            auto_update: false,
            cleanup: true,
            label_filter: None,
            event_buffer_size: 1024,
            max_parallel_updates: 1,
            update_history_size: 100,
            stop_grace: Duration::from_secs(10),
            apply_timeout: Duration::from_secs(120),
            start_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            port: 8080,
            runtime_endpoint: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("configuration out of bounds: {0}")]
    OutOfBounds(String),
}

impl AgentConfig {
    /// Build the startup configuration from the recognised environment
    /// variables. Any unparseable or out-of-bounds value is a startup error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = parse_env::<u64>("CHECK_INTERVAL")? {
            config.check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env::<u64>("UPDATE_INTERVAL")? {
            config.update_interval = Duration::from_secs(secs);
        }
        if let Some(v) = parse_env_bool("AUTO_UPDATE")? {
            config.auto_update = v;
        }
        if let Some(v) = parse_env_bool("CLEANUP")? {
            config.cleanup = v;
        }
        if let Some(v) = parse_env::<u16>("PORT")? {
            config.port = v;
        }
        if let Ok(endpoint) = std::env::var("RUNTIME_ENDPOINT") {
            if !endpoint.is_empty() {
                config.runtime_endpoint = Some(endpoint);
            }
        }
        if let Some(v) = parse_env::<usize>("MAX_PARALLEL_UPDATES")? {
            config.max_parallel_updates = v;
        }
        if let Some(v) = parse_env::<usize>("EVENT_BUFFER_SIZE")? {
            config.event_buffer_size = v;
        }

        if let Err(errors) = config.validate() {
            return Err(ConfigError::OutOfBounds(errors.join("; ")));
        }
        Ok(config)
    }

    /// Check every bound; returns one message per offending field.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let check = self.check_interval.as_secs();
        if !(10..=300).contains(&check) {
            errors.push(format!(
                "check_interval: must be between 10 and 300 seconds, got {check}"
            ));
        }
        let update = self.update_interval.as_secs();
        if !(30..=86_400).contains(&update) {
            errors.push(format!(
                "update_interval: must be between 30 and 86400 seconds, got {update}"
            ));
        }
        if !(8..=65_536).contains(&self.event_buffer_size) {
            errors.push(format!(
                "event_buffer_size: must be between 8 and 65536, got {}",
                self.event_buffer_size
            ));
        }
        if !(1..=16).contains(&self.max_parallel_updates) {
            errors.push(format!(
                "max_parallel_updates: must be between 1 and 16, got {}",
                self.max_parallel_updates
            ));
        }
        if !(1..=10_000).contains(&self.update_history_size) {
            errors.push(format!(
                "update_history_size: must be between 1 and 10000, got {}",
                self.update_history_size
            ));
        }
        if let Some(filter) = &self.label_filter {
            if filter.key.is_empty() {
                errors.push("label_filter: key must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnv {
                var,
                value: raw,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn parse_env_bool(var: &'static str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnv {
                var,
                value: raw,
                reason: "expected true/false".to_string(),
            }),
        },
        Err(_) => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Configuration PUT
// ---------------------------------------------------------------------------

/// Partial configuration update: absent fields keep their current value.
/// `label_filter` distinguishes "absent" from an explicit `null` (clear).
#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct ConfigUpdate {
    #[serde(default)]
    pub check_interval: Option<u64>,
    #[serde(default)]
    pub update_interval: Option<u64>,
    #[serde(default)]
    pub auto_update: Option<bool>,
    #[serde(default)]
    pub cleanup: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    #[schema(value_type = Option<LabelFilter>)]
    pub label_filter: Option<Option<LabelFilter>>,
    #[serde(default)]
    pub event_buffer_size: Option<usize>,
    #[serde(default)]
    pub max_parallel_updates: Option<usize>,
    #[serde(default)]
    pub update_history_size: Option<usize>,
}

fn double_option<'de, D>(de: D) -> Result<Option<Option<LabelFilter>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<LabelFilter>::deserialize(de).map(Some)
}

impl ConfigUpdate {
    /// Apply this patch to a copy of `current`, validating the result.
    /// Returns the new configuration or the per-field validation messages.
    pub fn apply_to(&self, current: &AgentConfig) -> Result<AgentConfig, Vec<String>> {
        let mut next = current.clone();

        if let Some(secs) = self.check_interval {
            next.check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.update_interval {
            next.update_interval = Duration::from_secs(secs);
        }
        if let Some(v) = self.auto_update {
            next.auto_update = v;
        }
        if let Some(v) = self.cleanup {
            next.cleanup = v;
        }
        if let Some(filter) = &self.label_filter {
            next.label_filter = filter.clone();
        }
        if let Some(v) = self.event_buffer_size {
            next.event_buffer_size = v;
        }
        if let Some(v) = self.max_parallel_updates {
            next.max_parallel_updates = v;
        }
        if let Some(v) = self.update_history_size {
            next.update_history_size = v;
        }

        next.validate()?;
        Ok(next)
    }
}

mod duration_secs {
    use super::*;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(de)?;
        Ok(Duration::from_secs(secs))
    }
}
