use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::ContainerStatus;

/// One domain occurrence. Serializes as the wire envelope
/// `{ "sequence": N, "at": "...", "container_id": "...", "kind": "...", "payload": { ... } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event taxonomy with typed payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum EventKind {
    #[serde(rename = "agent.started")]
    AgentStarted { monitored: usize },

    #[serde(rename = "agent.stopped")]
    AgentStopped,

    #[serde(rename = "container.registered")]
    ContainerRegistered { name: String, image_ref: String },

    #[serde(rename = "container.unregistered")]
    ContainerUnregistered { name: String },

    #[serde(rename = "container.status_changed")]
    ContainerStatusChanged {
        old_status: ContainerStatus,
        new_status: ContainerStatus,
    },

    #[serde(rename = "update.available")]
    UpdateAvailable {
        old_digest: Option<String>,
        new_digest: String,
    },

    #[serde(rename = "update.started")]
    UpdateStarted { image_ref: String },

    #[serde(rename = "update.applied")]
    UpdateApplied {
        old_digest: Option<String>,
        new_digest: Option<String>,
    },

    #[serde(rename = "update.failed")]
    UpdateFailed { kind: String, error: String },

    #[serde(rename = "runtime.unavailable")]
    RuntimeUnavailable { error: String },

    #[serde(rename = "runtime.recovered")]
    RuntimeRecovered,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::AgentStarted { .. } => "agent.started",
            EventKind::AgentStopped => "agent.stopped",
            EventKind::ContainerRegistered { .. } => "container.registered",
            EventKind::ContainerUnregistered { .. } => "container.unregistered",
            EventKind::ContainerStatusChanged { .. } => "container.status_changed",
            EventKind::UpdateAvailable { .. } => "update.available",
            EventKind::UpdateStarted { .. } => "update.started",
            EventKind::UpdateApplied { .. } => "update.applied",
            EventKind::UpdateFailed { .. } => "update.failed",
            EventKind::RuntimeUnavailable { .. } => "runtime.unavailable",
            EventKind::RuntimeRecovered => "runtime.recovered",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape() {
        let event = Event {
            sequence: 7,
            at: Utc::now(),
            container_id: Some("c1".into()),
            kind: EventKind::UpdateAvailable {
                old_digest: Some("sha256:aaa".into()),
                new_digest: "sha256:ccc".into(),
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["container_id"], "c1");
        assert_eq!(json["kind"], "update.available");
        assert_eq!(json["payload"]["old_digest"], "sha256:aaa");
        assert_eq!(json["payload"]["new_digest"], "sha256:ccc");
    }

    #[test]
    fn unit_kind_has_no_payload() {
        let event = Event {
            sequence: 1,
            at: Utc::now(),
            container_id: None,
            kind: EventKind::RuntimeRecovered,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "runtime.recovered");
        assert!(json.get("payload").is_none());
        assert!(json.get("container_id").is_none());
    }

    #[test]
    fn serde_roundtrip() {
        let event = Event {
            sequence: 3,
            at: Utc::now(),
            container_id: Some("c2".into()),
            kind: EventKind::ContainerStatusChanged {
                old_status: ContainerStatus::Running,
                new_status: ContainerStatus::Exited,
            },
        };

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sequence, 3);
        assert_eq!(parsed.kind, event.kind);
    }

    #[test]
    fn kind_names_match_wire_tags() {
        let kind = EventKind::AgentStarted { monitored: 2 };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], kind.name());
    }
}
