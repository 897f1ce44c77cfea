pub mod api;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod fingerprint;
pub mod monitor;
pub mod registry;
pub mod updater;

pub mod runtime;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use config::{AgentConfig, SharedConfig};
use event_bus::{EventBus, EventKind};
use monitor::Monitor;
use registry::ContainerRegistry;
use runtime::ContainerRuntime;
use updater::UpdateEngine;

/// Liveness facts shared between the monitor loop and the control surface.
pub struct Health {
    pub started_at: DateTime<Utc>,
    pub last_check_at: Mutex<Option<DateTime<Utc>>>,
    pub runtime_available: AtomicBool,
}

impl Health {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            last_check_at: Mutex::new(None),
            runtime_available: AtomicBool::new(true),
        }
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled agent: configuration, runtime adapter, registry, event bus
/// and update engine, wired for one process lifetime.
pub struct Agent {
    pub config: SharedConfig,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub registry: Arc<ContainerRegistry>,
    pub bus: Arc<EventBus>,
    pub updater: Arc<UpdateEngine>,
    pub health: Arc<Health>,
}

pub type AppState = Arc<Agent>;

impl Agent {
    pub fn new(config: AgentConfig, runtime: Arc<dyn ContainerRuntime>) -> Arc<Self> {
        let event_buffer_size = config.event_buffer_size;
        let config: SharedConfig = Arc::new(RwLock::new(config));
        let bus = Arc::new(EventBus::new(event_buffer_size));
        let registry = Arc::new(ContainerRegistry::new(bus.clone()));
        let updater = Arc::new(UpdateEngine::new(
            runtime.clone(),
            registry.clone(),
            bus.clone(),
            config.clone(),
        ));

        Arc::new(Self {
            config,
            runtime,
            registry,
            bus,
            updater,
            health: Arc::new(Health::new()),
        })
    }

    /// Emit the restart announcement; always the first event of a process
    /// lifetime.
    pub fn announce_start(&self) {
        self.bus.emit(
            None,
            EventKind::AgentStarted {
                monitored: self.registry.len(),
            },
        );
    }

    /// Announce the (re)start and spawn the two long-lived tasks: the
    /// monitor loop and the update scheduler.
    pub fn start(&self, shutdown: watch::Receiver<bool>) {
        self.announce_start();

        let monitor = Monitor::new(
            self.runtime.clone(),
            self.registry.clone(),
            self.bus.clone(),
            self.config.clone(),
            self.health.clone(),
        );
        tokio::spawn(monitor.run(shutdown.clone()));
        tokio::spawn(self.updater.clone().run_scheduler(shutdown));

        log::info!(
            "agent started, runtime endpoint {}",
            self.runtime.endpoint()
        );
    }

    pub fn stop(&self) {
        self.bus.emit(None, EventKind::AgentStopped);
        log::info!("agent stopped");
    }

    pub fn status_label(&self) -> &'static str {
        if self.health.runtime_available.load(Ordering::SeqCst) {
            "running"
        } else {
            "degraded"
        }
    }
}
