//! Periodic reconciliation between runtime truth and the registry.
//!
//! Each tick lists the runtime, applies the label filter, diffs against the
//! registry snapshot and submits the result. A full listing failure marks
//! the runtime unavailable (one event per outage, one on recovery) and
//! leaves the registry untouched so a transient daemon outage never causes
//! spurious unregistrations.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use crate::config::SharedConfig;
use crate::event_bus::{EventBus, EventKind};
use crate::registry::{ContainerRegistry, ObservationDiff, ObservedContainer};
use crate::runtime::{ContainerRuntime, ContainerSummary, RuntimeError};
use crate::Health;

pub struct Monitor {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ContainerRegistry>,
    bus: Arc<EventBus>,
    config: SharedConfig,
    health: Arc<Health>,
    runtime_down: bool,
}

impl Monitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<ContainerRegistry>,
        bus: Arc<EventBus>,
        config: SharedConfig,
        health: Arc<Health>,
    ) -> Self {
        Self {
            runtime,
            registry,
            bus,
            config,
            health,
            runtime_down: false,
        }
    }

    /// Run until shutdown. The first reconciliation happens immediately;
    /// the sleep between ticks is cancellation-aware.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.tick().await;

            let interval = self.config.read().unwrap().check_interval;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        log::info!("monitor loop stopped");
    }

    /// One reconciliation pass. Public so tests can drive the loop
    /// deterministically.
    pub async fn tick(&mut self) {
        let listing = match self.runtime.list().await {
            Ok(listing) => listing,
            Err(e) => {
                log::warn!("runtime listing failed: {e}");
                if !self.runtime_down {
                    self.runtime_down = true;
                    self.health.runtime_available.store(false, Ordering::SeqCst);
                    self.bus.emit(
                        None,
                        EventKind::RuntimeUnavailable {
                            error: e.to_string(),
                        },
                    );
                }
                return;
            }
        };

        if self.runtime_down {
            self.runtime_down = false;
            self.health.runtime_available.store(true, Ordering::SeqCst);
            self.bus.emit(None, EventKind::RuntimeRecovered);
        }

        for diagnostic in &listing.diagnostics {
            log::warn!("listing diagnostic: {diagnostic}");
        }

        let filter = self.config.read().unwrap().label_filter.clone();
        let observed: Vec<ContainerSummary> = listing
            .containers
            .into_iter()
            .filter(|c| filter.as_ref().map_or(true, |f| f.matches(&c.labels)))
            .collect();

        let snapshot = self.registry.snapshot();
        let known: HashMap<&str, &crate::registry::ContainerRecord> =
            snapshot.iter().map(|r| (r.id.as_str(), r)).collect();
        let observed_ids: HashSet<&str> = observed.iter().map(|c| c.id.as_str()).collect();

        let mut diff = ObservationDiff::default();

        for summary in &observed {
            match known.get(summary.id.as_str()) {
                None => match self.runtime.inspect(&summary.id).await {
                    Ok(detail) => diff.added.push(ObservedContainer::from_detail(&detail)),
                    Err(RuntimeError::NotFound(_)) => {
                        log::debug!("container {} vanished before inspection", summary.id);
                    }
                    Err(e) => {
                        log::warn!(
                            "inspect of {} failed ({e}), registering without detail",
                            summary.id
                        );
                        diff.added.push(ObservedContainer::from_summary(summary));
                    }
                },
                Some(record) => {
                    let changed = record.status != summary.status
                        || record.labels != summary.labels
                        || record.image_ref != summary.image_ref;
                    // Digest and fingerprint only come from inspection;
                    // backfill them when missing or when the status moved.
                    let want_detail = record.status != summary.status
                        || record.image_digest.is_none()
                        || record.env_fingerprint.is_none();

                    if changed || want_detail {
                        match self.runtime.inspect(&summary.id).await {
                            Ok(detail) => {
                                diff.updated.push(ObservedContainer::from_detail(&detail))
                            }
                            Err(RuntimeError::NotFound(_)) => {
                                // Gone mid-tick; the removal branch below
                                // will not see it either, so defer to the
                                // next tick.
                                diff.refreshed.push(summary.id.clone());
                            }
                            Err(_) if changed => {
                                diff.updated.push(ObservedContainer::from_summary(summary))
                            }
                            Err(_) => diff.refreshed.push(summary.id.clone()),
                        }
                    } else {
                        diff.refreshed.push(summary.id.clone());
                    }
                }
            }
        }

        for record in &snapshot {
            if !observed_ids.contains(record.id.as_str()) {
                diff.removed.push(record.id.clone());
            }
        }

        self.registry.apply_observation(diff);
        *self.health.last_check_at.lock().unwrap() = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, LabelFilter};
    use crate::runtime::mock::{FakeContainer, MockRuntime};
    use crate::runtime::ContainerStatus;
    use std::sync::RwLock;

    fn setup(runtime: Arc<MockRuntime>) -> (Arc<EventBus>, Arc<ContainerRegistry>, Monitor) {
        setup_with_config(runtime, AgentConfig::default())
    }

    fn setup_with_config(
        runtime: Arc<MockRuntime>,
        config: AgentConfig,
    ) -> (Arc<EventBus>, Arc<ContainerRegistry>, Monitor) {
        let bus = Arc::new(EventBus::new(64));
        let registry = Arc::new(ContainerRegistry::new(bus.clone()));
        let monitor = Monitor::new(
            runtime,
            registry.clone(),
            bus.clone(),
            Arc::new(RwLock::new(config)),
            Arc::new(Health::new()),
        );
        (bus, registry, monitor)
    }

    #[tokio::test]
    async fn first_tick_registers_with_detail() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_container(FakeContainer::running("c1", "web", "app:1", "sha256:aaa")),
        );
        let (bus, registry, mut monitor) = setup(runtime);

        monitor.tick().await;

        let record = registry.get("c1").unwrap();
        assert_eq!(record.image_digest.as_deref(), Some("sha256:aaa"));
        assert!(record.env_fingerprint.is_some());

        let kinds: Vec<&'static str> = bus.replay(0).iter().map(|e| e.kind.name()).collect();
        assert_eq!(kinds, vec!["container.registered"]);
    }

    #[tokio::test]
    async fn status_change_surfaces_once() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_container(FakeContainer::running("c1", "web", "app:1", "sha256:aaa")),
        );
        let (bus, _registry, mut monitor) = setup(runtime.clone());

        monitor.tick().await;
        runtime.set_status("c1", ContainerStatus::Exited);
        monitor.tick().await;
        monitor.tick().await;

        let kinds: Vec<&'static str> = bus.replay(0).iter().map(|e| e.kind.name()).collect();
        assert_eq!(
            kinds,
            vec!["container.registered", "container.status_changed"]
        );
    }

    #[tokio::test]
    async fn disappeared_container_unregistered() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_container(FakeContainer::running("c1", "web", "app:1", "sha256:aaa")),
        );
        let (_bus, registry, mut monitor) = setup(runtime.clone());

        monitor.tick().await;
        assert_eq!(registry.len(), 1);

        runtime.drop_container("c1");
        monitor.tick().await;
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn outage_emits_one_unavailable_and_one_recovered() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_container(FakeContainer::running("c1", "web", "app:1", "sha256:aaa")),
        );
        let (bus, registry, mut monitor) = setup(runtime.clone());

        monitor.tick().await;
        assert_eq!(registry.len(), 1);

        runtime.fail_list("socket gone");
        monitor.tick().await;
        monitor.tick().await;
        monitor.tick().await;

        // Registry untouched across the outage
        assert_eq!(registry.len(), 1);

        runtime.clear_list_failure();
        monitor.tick().await;

        let kinds: Vec<&'static str> = bus.replay(0).iter().map(|e| e.kind.name()).collect();
        assert_eq!(
            kinds,
            vec![
                "container.registered",
                "runtime.unavailable",
                "runtime.recovered"
            ]
        );
    }

    #[tokio::test]
    async fn label_filter_limits_monitoring() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_container(
                    FakeContainer::running("c1", "web", "app:1", "sha256:aaa")
                        .with_label("watch", "yes"),
                )
                .with_container(FakeContainer::running("c2", "db", "pg:16", "sha256:bbb")),
        );

        let mut config = AgentConfig::default();
        config.label_filter = Some(LabelFilter {
            key: "watch".into(),
            value: None,
        });
        let (_bus, registry, mut monitor) = setup_with_config(runtime, config);

        monitor.tick().await;

        assert_eq!(registry.len(), 1);
        assert!(registry.get("c1").is_some());
        assert!(registry.get("c2").is_none());
    }

    #[tokio::test]
    async fn same_name_new_id_is_a_new_container() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_container(FakeContainer::running("c1", "web", "app:1", "sha256:aaa")),
        );
        let (_bus, registry, mut monitor) = setup(runtime.clone());

        monitor.tick().await;

        // A second container under the same name but a new id appears;
        // create under a scratch name, then rename into the collision.
        let new_id = runtime
            .create(crate::runtime::CreateSpec {
                name: "web-twin".into(),
                image_ref: "app:1".into(),
                env: vec![],
                labels: HashMap::new(),
                ports: vec![],
                mounts: vec![],
            })
            .await
            .unwrap();
        runtime.rename(&new_id, "web").await.unwrap();

        monitor.tick().await;

        // Both ids coexist until the runtime reports the old one gone
        assert_eq!(registry.len(), 2);
        assert!(registry.get("c1").is_some());
        assert!(registry.get(&new_id).is_some());
    }
}
