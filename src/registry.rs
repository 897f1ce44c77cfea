//! Authoritative in-memory view of monitored containers.
//!
//! Single-owner map behind a mutex: the monitor loop is the only writer of
//! observations, the update engine writes back only the update-state triple
//! through `set_update_state`, and everyone else reads cloned snapshots.
//! No reference to the internal map ever escapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::{AgentError, AgentResult};
use crate::event_bus::{EventBus, EventKind};
use crate::fingerprint::env_fingerprint;
use crate::runtime::{ContainerDetail, ContainerStatus, ContainerSummary, PortMapping};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Checking,
    UpdateAvailable,
    Updating,
    Updated,
    Failed,
}

impl UpdatePhase {
    /// Legal moves along the linear update state machine. Backwards moves
    /// must pass through `Idle` or `Failed`.
    pub fn can_transition(self, to: UpdatePhase) -> bool {
        use UpdatePhase::*;
        matches!(
            (self, to),
            (Idle, Checking)
                | (Checking, Idle)
                | (Checking, UpdateAvailable)
                | (UpdateAvailable, Updating)
                | (UpdateAvailable, Idle)
                | (Idle, Updating)
                | (Updating, Updated)
                | (Updating, Failed)
                | (Updated, Idle)
                | (Failed, Idle)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct UpdateState {
    pub phase: UpdatePhase,
    pub changed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl UpdateState {
    fn idle() -> Self {
        Self {
            phase: UpdatePhase::Idle,
            changed_at: Utc::now(),
            last_error: None,
        }
    }
}

/// What the agent knows about one container.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    pub status: ContainerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_fingerprint: Option<String>,
    pub update_state: UpdateState,
}

// ---------------------------------------------------------------------------
// Observations
// ---------------------------------------------------------------------------

/// One container as observed during a reconciliation tick. Fields that only
/// inspection can fill are `None` when the observation came from a listing.
#[derive(Debug, Clone)]
pub struct ObservedContainer {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub image_digest: Option<String>,
    pub status: ContainerStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
    pub ports: Option<Vec<PortMapping>>,
    pub env_fingerprint: Option<String>,
}

impl ObservedContainer {
    pub fn from_detail(detail: &ContainerDetail) -> Self {
        Self {
            id: detail.id.clone(),
            name: detail.name.clone(),
            image_ref: detail.image_ref.clone(),
            image_digest: detail.image_digest.clone(),
            status: detail.status,
            created_at: detail.created_at,
            started_at: detail.started_at,
            labels: detail.labels.clone(),
            ports: Some(detail.ports.clone()),
            env_fingerprint: env_fingerprint(detail),
        }
    }

    pub fn from_summary(summary: &ContainerSummary) -> Self {
        Self {
            id: summary.id.clone(),
            name: summary.name.clone(),
            image_ref: summary.image_ref.clone(),
            image_digest: None,
            status: summary.status,
            created_at: summary.created_at,
            started_at: None,
            labels: summary.labels.clone(),
            ports: None,
            env_fingerprint: None,
        }
    }
}

/// The diff the monitor submits after one tick. Per container id the order
/// is add before update before remove; `refreshed` carries ids that were
/// seen unchanged (their `last_seen_at` is bumped without a delta).
#[derive(Debug, Default)]
pub struct ObservationDiff {
    pub added: Vec<ObservedContainer>,
    pub updated: Vec<ObservedContainer>,
    pub refreshed: Vec<String>,
    pub removed: Vec<String>,
}

/// Per-record change pushed to registry subscribers.
#[derive(Debug, Clone)]
pub enum RegistryDelta {
    Added(ContainerRecord),
    Updated(ContainerRecord),
    Removed { id: String },
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct RegistryInner {
    records: HashMap<String, ContainerRecord>,
    subscribers: Vec<mpsc::UnboundedSender<RegistryDelta>>,
}

pub struct ContainerRegistry {
    inner: Mutex<RegistryInner>,
    bus: Arc<EventBus>,
}

impl ContainerRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                records: HashMap::new(),
                subscribers: Vec::new(),
            }),
            bus,
        }
    }

    /// Consistent, immutable copy of all records, sorted by name.
    pub fn snapshot(&self) -> Vec<ContainerRecord> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<ContainerRecord> = inner.records.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn get(&self, id: &str) -> Option<ContainerRecord> {
        self.inner.lock().unwrap().records.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push channel of per-record deltas, ordered per container id.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryDelta> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().subscribers.push(tx);
        rx
    }

    /// Reconciliation entry point, consumed only by the monitor loop.
    /// Emits `container.*` events and deltas synchronously with each change.
    pub fn apply_observation(&self, diff: ObservationDiff) {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        for observed in diff.added {
            if inner.records.contains_key(&observed.id) {
                log::debug!("observed add for known container {}, updating", observed.id);
                apply_update(&mut inner, &self.bus, observed, now);
                continue;
            }

            let record = ContainerRecord {
                id: observed.id.clone(),
                name: observed.name.clone(),
                image_ref: observed.image_ref.clone(),
                image_digest: observed.image_digest,
                status: observed.status,
                created_at: observed.created_at,
                started_at: observed.started_at,
                last_seen_at: now,
                labels: observed.labels,
                ports: observed.ports.unwrap_or_default(),
                env_fingerprint: observed.env_fingerprint,
                update_state: UpdateState::idle(),
            };

            log::info!("registered container {} ({})", record.name, record.id);
            self.bus.emit(
                Some(&record.id),
                EventKind::ContainerRegistered {
                    name: record.name.clone(),
                    image_ref: record.image_ref.clone(),
                },
            );
            inner.records.insert(record.id.clone(), record.clone());
            push_delta(&mut inner.subscribers, RegistryDelta::Added(record));
        }

        for observed in diff.updated {
            apply_update(&mut inner, &self.bus, observed, now);
        }

        for id in diff.refreshed {
            if let Some(record) = inner.records.get_mut(&id) {
                record.last_seen_at = now;
            }
        }

        for id in diff.removed {
            let Some(record) = inner.records.get(&id) else {
                continue;
            };
            // The update engine is reconstructing this container; its
            // disappearance from the runtime is expected and temporary.
            if record.update_state.phase == UpdatePhase::Updating {
                log::debug!("deferring removal of {id}: update in flight");
                continue;
            }

            let name = record.name.clone();
            inner.records.remove(&id);
            log::info!("unregistered container {name} ({id})");
            self.bus
                .emit(Some(&id), EventKind::ContainerUnregistered { name });
            push_delta(&mut inner.subscribers, RegistryDelta::Removed { id });
        }
    }

    /// Narrow mutator consumed only by the update engine. Rejects moves the
    /// linear state machine does not allow.
    pub fn set_update_state(
        &self,
        id: &str,
        phase: UpdatePhase,
        error: Option<String>,
    ) -> AgentResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(format!("container {id}")))?;

        let from = record.update_state.phase;
        if !from.can_transition(phase) {
            return Err(AgentError::Conflict(format!(
                "update state of {id} is {from:?}, cannot move to {phase:?}"
            )));
        }

        record.update_state = UpdateState {
            phase,
            changed_at: Utc::now(),
            last_error: error,
        };
        let snapshot = record.clone();
        push_delta(&mut inner.subscribers, RegistryDelta::Updated(snapshot));
        Ok(())
    }

    /// Swap the record of a replaced container for its successor, used by
    /// the update engine at the end of a successful apply. The successor
    /// starts in phase `updated`.
    pub fn record_replacement(&self, old_id: &str, observed: ObservedContainer) {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        if let Some(old) = inner.records.remove(old_id) {
            self.bus.emit(
                Some(old_id),
                EventKind::ContainerUnregistered {
                    name: old.name.clone(),
                },
            );
            push_delta(
                &mut inner.subscribers,
                RegistryDelta::Removed {
                    id: old_id.to_string(),
                },
            );
        }

        let record = ContainerRecord {
            id: observed.id.clone(),
            name: observed.name.clone(),
            image_ref: observed.image_ref.clone(),
            image_digest: observed.image_digest,
            status: observed.status,
            created_at: observed.created_at,
            started_at: observed.started_at,
            last_seen_at: now,
            labels: observed.labels,
            ports: observed.ports.unwrap_or_default(),
            env_fingerprint: observed.env_fingerprint,
            update_state: UpdateState {
                phase: UpdatePhase::Updated,
                changed_at: now,
                last_error: None,
            },
        };

        // The monitor may have observed the successor already; only announce
        // containers the registry has not seen.
        let already_known = inner.records.contains_key(&record.id);
        if !already_known {
            self.bus.emit(
                Some(&record.id),
                EventKind::ContainerRegistered {
                    name: record.name.clone(),
                    image_ref: record.image_ref.clone(),
                },
            );
        }
        inner.records.insert(record.id.clone(), record.clone());
        let delta = if already_known {
            RegistryDelta::Updated(record)
        } else {
            RegistryDelta::Added(record)
        };
        push_delta(&mut inner.subscribers, delta);
    }
}

fn apply_update(
    inner: &mut RegistryInner,
    bus: &EventBus,
    observed: ObservedContainer,
    now: DateTime<Utc>,
) {
    let Some(record) = inner.records.get_mut(&observed.id) else {
        log::debug!("observed update for unknown container {}, ignoring", observed.id);
        return;
    };

    // The update engine is reconstructing this container; the monitor would
    // otherwise observe the stopped, renamed-aside predecessor and leak
    // those replace-procedure artifacts into the record and event stream.
    if record.update_state.phase == UpdatePhase::Updating {
        log::debug!("deferring observation of {}: update in flight", observed.id);
        record.last_seen_at = now;
        return;
    }

    if record.status != observed.status {
        bus.emit(
            Some(&record.id),
            EventKind::ContainerStatusChanged {
                old_status: record.status,
                new_status: observed.status,
            },
        );
        record.status = observed.status;
    }

    record.name = observed.name;
    record.image_ref = observed.image_ref;
    record.labels = observed.labels;
    record.last_seen_at = now;
    if let Some(digest) = observed.image_digest {
        record.image_digest = Some(digest);
    }
    if let Some(ports) = observed.ports {
        record.ports = ports;
    }
    if let Some(fingerprint) = observed.env_fingerprint {
        record.env_fingerprint = Some(fingerprint);
    }
    if observed.started_at.is_some() {
        record.started_at = observed.started_at;
    }
    if observed.created_at.is_some() {
        record.created_at = observed.created_at;
    }

    let snapshot = record.clone();
    push_delta(&mut inner.subscribers, RegistryDelta::Updated(snapshot));
}

fn push_delta(subscribers: &mut Vec<mpsc::UnboundedSender<RegistryDelta>>, delta: RegistryDelta) {
    subscribers.retain(|tx| tx.send(delta.clone()).is_ok());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (Arc<EventBus>, ContainerRegistry) {
        let bus = Arc::new(EventBus::new(64));
        let registry = ContainerRegistry::new(bus.clone());
        (bus, registry)
    }

    fn observed(id: &str, name: &str, status: ContainerStatus) -> ObservedContainer {
        ObservedContainer {
            id: id.to_string(),
            name: name.to_string(),
            image_ref: "app:1".to_string(),
            image_digest: Some("sha256:aaa".to_string()),
            status,
            created_at: None,
            started_at: None,
            labels: HashMap::new(),
            ports: Some(Vec::new()),
            env_fingerprint: Some("fp".to_string()),
        }
    }

    #[test]
    fn add_update_remove_cycle() {
        let (bus, registry) = registry();

        registry.apply_observation(ObservationDiff {
            added: vec![observed("c1", "web", ContainerStatus::Running)],
            ..Default::default()
        });
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("c1").unwrap().update_state.phase,
            UpdatePhase::Idle
        );

        registry.apply_observation(ObservationDiff {
            updated: vec![observed("c1", "web", ContainerStatus::Exited)],
            ..Default::default()
        });
        assert_eq!(registry.get("c1").unwrap().status, ContainerStatus::Exited);

        registry.apply_observation(ObservationDiff {
            removed: vec!["c1".to_string()],
            ..Default::default()
        });
        assert!(registry.get("c1").is_none());

        let kinds: Vec<&'static str> = bus.replay(0).iter().map(|e| e.kind.name()).collect();
        assert_eq!(
            kinds,
            vec![
                "container.registered",
                "container.status_changed",
                "container.unregistered"
            ]
        );
    }

    #[test]
    fn unchanged_status_emits_no_event() {
        let (bus, registry) = registry();
        registry.apply_observation(ObservationDiff {
            added: vec![observed("c1", "web", ContainerStatus::Running)],
            ..Default::default()
        });
        registry.apply_observation(ObservationDiff {
            updated: vec![observed("c1", "web", ContainerStatus::Running)],
            ..Default::default()
        });

        let kinds: Vec<&'static str> = bus.replay(0).iter().map(|e| e.kind.name()).collect();
        assert_eq!(kinds, vec!["container.registered"]);
    }

    #[test]
    fn observation_deferred_while_updating() {
        let (bus, registry) = registry();
        registry.apply_observation(ObservationDiff {
            added: vec![observed("c1", "web", ContainerStatus::Running)],
            ..Default::default()
        });
        registry
            .set_update_state("c1", UpdatePhase::Updating, None)
            .unwrap();

        // Mid-replace the monitor sees the stopped, renamed-aside
        // predecessor; none of that may reach the record.
        registry.apply_observation(ObservationDiff {
            updated: vec![observed(
                "c1",
                "web-replaced-c1",
                ContainerStatus::Exited,
            )],
            ..Default::default()
        });

        let record = registry.get("c1").unwrap();
        assert_eq!(record.name, "web");
        assert_eq!(record.status, ContainerStatus::Running);

        let kinds: Vec<&'static str> = bus.replay(0).iter().map(|e| e.kind.name()).collect();
        assert_eq!(kinds, vec!["container.registered"]);

        // Once the update settles, observations land again
        registry
            .set_update_state("c1", UpdatePhase::Failed, Some("boom".into()))
            .unwrap();
        registry
            .set_update_state("c1", UpdatePhase::Idle, None)
            .unwrap();
        registry.apply_observation(ObservationDiff {
            updated: vec![observed("c1", "web", ContainerStatus::Exited)],
            ..Default::default()
        });
        assert_eq!(registry.get("c1").unwrap().status, ContainerStatus::Exited);
    }

    #[test]
    fn removal_deferred_while_updating() {
        let (_bus, registry) = registry();
        registry.apply_observation(ObservationDiff {
            added: vec![observed("c1", "web", ContainerStatus::Running)],
            ..Default::default()
        });
        registry
            .set_update_state("c1", UpdatePhase::Updating, None)
            .unwrap();

        registry.apply_observation(ObservationDiff {
            removed: vec!["c1".to_string()],
            ..Default::default()
        });
        assert!(registry.get("c1").is_some(), "removal must be deferred");

        // After the update settles the removal goes through
        registry
            .set_update_state("c1", UpdatePhase::Failed, Some("boom".into()))
            .unwrap();
        registry
            .set_update_state("c1", UpdatePhase::Idle, None)
            .unwrap();
        registry.apply_observation(ObservationDiff {
            removed: vec!["c1".to_string()],
            ..Default::default()
        });
        assert!(registry.get("c1").is_none());
    }

    #[test]
    fn illegal_transitions_rejected() {
        let (_bus, registry) = registry();
        registry.apply_observation(ObservationDiff {
            added: vec![observed("c1", "web", ContainerStatus::Running)],
            ..Default::default()
        });

        // Idle -> Updated skips the machine
        let err = registry
            .set_update_state("c1", UpdatePhase::Updated, None)
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        // Updating -> Checking goes backwards without idle/failed
        registry
            .set_update_state("c1", UpdatePhase::Updating, None)
            .unwrap();
        let err = registry
            .set_update_state("c1", UpdatePhase::Checking, None)
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[test]
    fn unknown_container_is_not_found() {
        let (_bus, registry) = registry();
        let err = registry
            .set_update_state("ghost", UpdatePhase::Checking, None)
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn deltas_track_changes_in_order() {
        let (_bus, registry) = registry();
        let mut rx = registry.subscribe();

        registry.apply_observation(ObservationDiff {
            added: vec![observed("c1", "web", ContainerStatus::Running)],
            ..Default::default()
        });
        registry.apply_observation(ObservationDiff {
            updated: vec![observed("c1", "web", ContainerStatus::Paused)],
            ..Default::default()
        });
        registry.apply_observation(ObservationDiff {
            removed: vec!["c1".to_string()],
            ..Default::default()
        });

        assert!(matches!(rx.try_recv().unwrap(), RegistryDelta::Added(_)));
        assert!(matches!(rx.try_recv().unwrap(), RegistryDelta::Updated(_)));
        assert!(matches!(rx.try_recv().unwrap(), RegistryDelta::Removed { .. }));
    }

    #[test]
    fn replacement_swaps_records() {
        let (bus, registry) = registry();
        registry.apply_observation(ObservationDiff {
            added: vec![observed("c1", "web", ContainerStatus::Running)],
            ..Default::default()
        });
        registry
            .set_update_state("c1", UpdatePhase::Updating, None)
            .unwrap();

        let mut replacement = observed("c2", "web", ContainerStatus::Running);
        replacement.image_digest = Some("sha256:ccc".to_string());
        registry.record_replacement("c1", replacement);

        assert!(registry.get("c1").is_none());
        let new = registry.get("c2").unwrap();
        assert_eq!(new.image_digest.as_deref(), Some("sha256:ccc"));
        assert_eq!(new.update_state.phase, UpdatePhase::Updated);

        let kinds: Vec<&'static str> = bus.replay(0).iter().map(|e| e.kind.name()).collect();
        assert_eq!(
            kinds,
            vec![
                "container.registered",
                "container.unregistered",
                "container.registered"
            ]
        );
    }

    #[test]
    fn snapshot_is_sorted_and_detached() {
        let (_bus, registry) = registry();
        registry.apply_observation(ObservationDiff {
            added: vec![
                observed("c2", "zebra", ContainerStatus::Running),
                observed("c1", "alpha", ContainerStatus::Running),
            ],
            ..Default::default()
        });

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].name, "alpha");
        assert_eq!(snapshot[1].name, "zebra");

        // Mutating the registry afterwards does not affect the snapshot
        registry.apply_observation(ObservationDiff {
            removed: vec!["c1".to_string()],
            ..Default::default()
        });
        assert_eq!(snapshot.len(), 2);
    }
}
