//! Per-container update state machine, digest checking and the controlled
//! replace procedure.
//!
//! The scheduler sweeps at `update_interval` (or on a nudge) and moves idle
//! running containers through `checking`. Apply procedures queue FIFO on a
//! fair semaphore sized by `max_parallel_updates`; each runs under a hard
//! ceiling and rolls back at most once on failure.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify, Semaphore};

use crate::config::SharedConfig;
use crate::error::{AgentError, AgentResult};
use crate::event_bus::{EventBus, EventKind};
use crate::fingerprint::env_fingerprint;
use crate::registry::{ContainerRegistry, ContainerRecord, ObservedContainer, UpdatePhase};
use crate::runtime::{ContainerRuntime, ContainerStatus, CreateSpec};

const PULL_ATTEMPTS: u32 = 3;
const WAIT_RUNNING_POLL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Update records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    Applied,
    Failed,
}

/// One completed or attempted update. Never mutated after finalisation.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct UpdateRecord {
    pub container_id: String,
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_image_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_image_digest: Option<String>,
    pub outcome: UpdateOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Tracks how far an apply got, so the rollback undoes exactly the steps
/// that happened even when the apply future was cut off by the ceiling.
#[derive(Debug, Clone, Default)]
struct ApplyProgress {
    stopped: bool,
    /// Original name, present once the old container was moved aside.
    renamed_from: Option<String>,
    /// Id of the successor container, once created.
    created: Option<String>,
}

struct AppliedUpdate {
    new_digest: Option<String>,
    observed: ObservedContainer,
}

pub struct UpdateEngine {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<ContainerRegistry>,
    bus: Arc<EventBus>,
    config: SharedConfig,
    history: Mutex<VecDeque<UpdateRecord>>,
    apply_permits: Arc<Semaphore>,
    max_parallel: usize,
    check_nudge: Notify,
}

impl UpdateEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<ContainerRegistry>,
        bus: Arc<EventBus>,
        config: SharedConfig,
    ) -> Self {
        let max_parallel = config.read().unwrap().max_parallel_updates.max(1);
        Self {
            runtime,
            registry,
            bus,
            config,
            history: Mutex::new(VecDeque::new()),
            apply_permits: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
            check_nudge: Notify::new(),
        }
    }

    /// Wait for queued and in-flight apply procedures to finish. The
    /// semaphore is fair, so everything already queued completes first.
    pub async fn drain(&self) {
        let _all = self
            .apply_permits
            .acquire_many(self.max_parallel as u32)
            .await;
    }

    /// Schedule a check sweep immediately.
    pub fn nudge(&self) {
        self.check_nudge.notify_one();
    }

    /// Last `limit` update records, newest first.
    pub fn history(&self, limit: usize) -> Vec<UpdateRecord> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    /// Run until shutdown, sweeping at `update_interval` or on a nudge.
    pub async fn run_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = self.config.read().unwrap().update_interval;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.check_nudge.notified() => {}
            }
            self.clone().check_sweep().await;
        }
        log::info!("update scheduler stopped");
    }

    /// One pass over the fleet: settle `updated`/`failed` back to `idle`,
    /// then check idle running containers for a moved image tag.
    pub async fn check_sweep(self: Arc<Self>) {
        let auto_update = self.config.read().unwrap().auto_update;

        for record in self.registry.snapshot() {
            match record.update_state.phase {
                UpdatePhase::Updated | UpdatePhase::Failed => {
                    let _ = self
                        .registry
                        .set_update_state(&record.id, UpdatePhase::Idle, None);
                }
                UpdatePhase::Idle if record.status == ContainerStatus::Running => {
                    self.clone().check_one(record, auto_update).await;
                }
                _ => {}
            }
        }
    }

    async fn check_one(self: Arc<Self>, record: ContainerRecord, auto_update: bool) {
        if self
            .registry
            .set_update_state(&record.id, UpdatePhase::Checking, None)
            .is_err()
        {
            return;
        }

        match self.pull_with_retry(&record.image_ref).await {
            Err(e) => {
                log::warn!("update check for {} failed: {e}", record.name);
                let _ = self
                    .registry
                    .set_update_state(&record.id, UpdatePhase::Idle, Some(e.to_string()));
            }
            Ok(None) => {
                log::debug!("{}: no digest for {}", record.name, record.image_ref);
                let _ = self
                    .registry
                    .set_update_state(&record.id, UpdatePhase::Idle, None);
            }
            Ok(Some(new_digest)) => match &record.image_digest {
                Some(current) if *current != new_digest => {
                    if self
                        .registry
                        .set_update_state(&record.id, UpdatePhase::UpdateAvailable, None)
                        .is_err()
                    {
                        return;
                    }
                    log::info!(
                        "update available for {}: {} -> {}",
                        record.name,
                        current,
                        new_digest
                    );
                    self.bus.emit(
                        Some(&record.id),
                        EventKind::UpdateAvailable {
                            old_digest: Some(current.clone()),
                            new_digest,
                        },
                    );
                    if auto_update {
                        if let Err(e) = self.begin_apply(&record.id) {
                            log::warn!("auto-update of {} not started: {e}", record.name);
                        }
                    }
                }
                Some(_) => {
                    let _ = self
                        .registry
                        .set_update_state(&record.id, UpdatePhase::Idle, None);
                }
                None => {
                    log::debug!(
                        "{}: running digest unknown, cannot compare",
                        record.name
                    );
                    let _ = self
                        .registry
                        .set_update_state(&record.id, UpdatePhase::Idle, None);
                }
            },
        }
    }

    /// Operator command: move the container into `updating` and queue the
    /// apply. Allowed from `idle` and `update_available` only.
    pub fn request_update(self: Arc<Self>, id: &str) -> AgentResult<()> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| AgentError::NotFound(format!("container {id}")))?;

        match record.update_state.phase {
            UpdatePhase::Updating => Err(AgentError::Conflict(format!(
                "update already in flight for {id}"
            ))),
            UpdatePhase::Idle | UpdatePhase::UpdateAvailable => self.begin_apply(id),
            phase => Err(AgentError::Conflict(format!(
                "container {id} is {phase:?}"
            ))),
        }
    }

    /// Operator dismiss/reset: back to `idle` from `update_available` or
    /// `failed`. Transition legality is enforced by the registry.
    pub fn dismiss(&self, id: &str) -> AgentResult<()> {
        self.registry.set_update_state(id, UpdatePhase::Idle, None)
    }

    fn begin_apply(self: Arc<Self>, id: &str) -> AgentResult<()> {
        let record = self
            .registry
            .get(id)
            .ok_or_else(|| AgentError::NotFound(format!("container {id}")))?;

        if record.env_fingerprint.is_none() {
            return Err(AgentError::ConfigNotReplicable(format!(
                "container {} has no stable configuration fingerprint",
                record.name
            )));
        }

        self.registry
            .set_update_state(id, UpdatePhase::Updating, None)?;

        let engine = self.clone();
        tokio::spawn(async move {
            engine.apply(record).await;
        });
        Ok(())
    }

    /// The apply procedure for one container. Queues on the fleet-wide
    /// semaphore (FIFO), runs under the hard ceiling, rolls back once on
    /// failure and finalises exactly one history record.
    async fn apply(self: Arc<Self>, record: ContainerRecord) {
        let Ok(_permit) = self.apply_permits.clone().acquire_owned().await else {
            return;
        };

        let started_at = Utc::now();
        self.bus.emit(
            Some(&record.id),
            EventKind::UpdateStarted {
                image_ref: record.image_ref.clone(),
            },
        );

        let (apply_timeout, grace, cleanup) = {
            let config = self.config.read().unwrap();
            (config.apply_timeout, config.stop_grace, config.cleanup)
        };

        let progress = Arc::new(Mutex::new(ApplyProgress::default()));
        let outcome = match tokio::time::timeout(
            apply_timeout,
            self.apply_inner(&record, grace, progress.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(format!(
                "apply exceeded {}s ceiling",
                apply_timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(applied) => {
                if cleanup {
                    if let Some(old_digest) = &record.image_digest {
                        if applied.new_digest.as_ref() != Some(old_digest) {
                            if let Err(e) = self.runtime.image_remove(old_digest).await {
                                log::debug!("cleanup of {old_digest} skipped: {e}");
                            }
                        }
                    }
                }

                let new_digest = applied.new_digest.clone();
                self.registry.record_replacement(&record.id, applied.observed);
                self.bus.emit(
                    Some(&record.id),
                    EventKind::UpdateApplied {
                        old_digest: record.image_digest.clone(),
                        new_digest: new_digest.clone(),
                    },
                );
                log::info!("updated {} ({})", record.name, record.image_ref);
                self.push_history(UpdateRecord {
                    container_id: record.id.clone(),
                    container_name: record.name.clone(),
                    old_image_digest: record.image_digest.clone(),
                    new_image_digest: new_digest,
                    outcome: UpdateOutcome::Applied,
                    started_at,
                    finished_at: Utc::now(),
                    error: None,
                });
            }
            Err(e) => {
                let error_text = match self.rollback(&record, &progress).await {
                    Ok(()) => e.to_string(),
                    Err(rollback_err) => {
                        log::error!(
                            "rollback of {} failed: {rollback_err}",
                            record.name
                        );
                        format!("{e} (rollback failed: {rollback_err})")
                    }
                };

                let _ = self.registry.set_update_state(
                    &record.id,
                    UpdatePhase::Failed,
                    Some(error_text.clone()),
                );
                self.bus.emit(
                    Some(&record.id),
                    EventKind::UpdateFailed {
                        kind: e.kind().to_string(),
                        error: error_text.clone(),
                    },
                );
                log::warn!("update of {} failed: {error_text}", record.name);
                self.push_history(UpdateRecord {
                    container_id: record.id.clone(),
                    container_name: record.name.clone(),
                    old_image_digest: record.image_digest.clone(),
                    new_image_digest: None,
                    outcome: UpdateOutcome::Failed,
                    started_at,
                    finished_at: Utc::now(),
                    error: Some(error_text),
                });
            }
        }
    }

    async fn apply_inner(
        &self,
        record: &ContainerRecord,
        grace: Duration,
        progress: Arc<Mutex<ApplyProgress>>,
    ) -> AgentResult<AppliedUpdate> {
        // The image must be locally present; the pull is idempotent.
        let pulled_digest = self.pull_with_retry(&record.image_ref).await?;

        // Fresh inspection is the recreation source of truth; a container
        // whose configuration cannot be captured is not safe to replace.
        let detail = self.runtime.inspect(&record.id).await?;
        if env_fingerprint(&detail).is_none() {
            return Err(AgentError::ConfigNotReplicable(format!(
                "inspection of {} is incomplete",
                record.name
            )));
        }

        let spec = CreateSpec {
            name: detail.name.clone(),
            image_ref: record.image_ref.clone(),
            env: detail.env.clone().unwrap_or_default(),
            labels: detail.labels.clone(),
            ports: detail.ports.clone(),
            mounts: detail.mounts.clone(),
        };

        self.runtime.stop(&record.id, grace).await?;
        progress.lock().unwrap().stopped = true;

        // Free the name for the successor
        let holding = holding_name(&detail.name, &record.id);
        self.runtime.rename(&record.id, &holding).await?;
        progress.lock().unwrap().renamed_from = Some(detail.name.clone());

        let new_id = self.runtime.create(spec).await?;
        progress.lock().unwrap().created = Some(new_id.clone());

        self.runtime.start(&new_id).await?;
        let start_timeout = self.config.read().unwrap().start_timeout;
        self.wait_running(&new_id, start_timeout).await?;

        if let Err(e) = self.runtime.remove(&record.id, true).await {
            log::warn!(
                "replaced container {} could not be removed: {e}",
                record.name
            );
        }

        let new_detail = self.runtime.inspect(&new_id).await?;
        Ok(AppliedUpdate {
            new_digest: new_detail.image_digest.clone().or(pulled_digest),
            observed: ObservedContainer::from_detail(&new_detail),
        })
    }

    /// Best-effort restoration of the prior state, attempted exactly once
    /// per failed apply.
    async fn rollback(
        &self,
        record: &ContainerRecord,
        progress: &Arc<Mutex<ApplyProgress>>,
    ) -> AgentResult<()> {
        let p = progress.lock().unwrap().clone();

        if let Some(new_id) = &p.created {
            if let Err(e) = self.runtime.remove(new_id, true).await {
                log::warn!("rollback: could not remove half-created {new_id}: {e}");
            }
        }

        if let Some(original) = &p.renamed_from {
            self.runtime.rename(&record.id, original).await?;
        }

        if p.stopped && record.status == ContainerStatus::Running {
            self.runtime.start(&record.id).await?;
        }

        Ok(())
    }

    async fn wait_running(&self, id: &str, timeout: Duration) -> AgentResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let detail = self.runtime.inspect(id).await?;
            if detail.status == ContainerStatus::Running {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentError::Timeout(format!(
                    "container {id} did not reach running within {}s",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(WAIT_RUNNING_POLL).await;
        }
    }

    async fn pull_with_retry(&self, image_ref: &str) -> AgentResult<Option<String>> {
        let mut attempt = 0u32;
        loop {
            match self.runtime.pull(image_ref).await {
                Ok(digest) => return Ok(digest),
                Err(e) if e.retryable() && attempt + 1 < PULL_ATTEMPTS => {
                    let backoff = pull_backoff(attempt);
                    log::warn!("pull of {image_ref} failed ({e}), retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn push_history(&self, record: UpdateRecord) {
        let cap = self.config.read().unwrap().update_history_size;
        let mut history = self.history.lock().unwrap();
        if history.len() >= cap {
            history.pop_front();
        }
        history.push_back(record);
    }
}

/// Exponential backoff: 1 s base, doubling, capped at 30 s.
fn pull_backoff(attempt: u32) -> Duration {
    Duration::from_secs((1u64 << attempt.min(5)).min(30))
}

fn holding_name(name: &str, id: &str) -> String {
    let short = &id[..id.len().min(12)];
    format!("{name}-replaced-{short}")
}
