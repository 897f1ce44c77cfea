use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use watchtower_agent::config::AgentConfig;
use watchtower_agent::runtime::docker::DockerRuntime;
use watchtower_agent::runtime::ContainerRuntime;
use watchtower_agent::{api, Agent};

const EXIT_CONFIG: u8 = 1;
const EXIT_INIT: u8 = 2;
const EXIT_PANIC: i32 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    std::panic::set_hook(Box::new(|info| {
        eprintln!("panic: {info}");
        std::process::exit(EXIT_PANIC);
    }));

    // LOG_LEVEL takes an env-filter expression ("info", "debug",
    // "watchtower_agent=debug", ...); an unparseable value is a startup error.
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = match EnvFilter::try_new(&log_level) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("invalid value for LOG_LEVEL: {log_level:?} ({e})");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .init();

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let runtime: Arc<dyn ContainerRuntime> =
        match DockerRuntime::connect(config.runtime_endpoint.as_deref()) {
            Ok(runtime) => Arc::new(runtime),
            Err(e) => {
                log::error!("runtime initialization failed: {e}");
                return ExitCode::from(EXIT_INIT);
            }
        };
    if let Err(e) = runtime.ping().await {
        log::error!("container runtime unreachable at startup: {e}");
        return ExitCode::from(EXIT_INIT);
    }

    let listener = match TcpListener::bind(("0.0.0.0", config.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("cannot bind port {}: {e}", config.port);
            return ExitCode::from(EXIT_INIT);
        }
    };
    log::info!("listening on 0.0.0.0:{}", config.port);

    let agent = Agent::new(config, runtime);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    agent.start(shutdown_rx.clone());

    tokio::spawn(async move {
        wait_for_signal().await;
        log::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let served = api::serve(agent.clone(), listener, shutdown_rx).await;

    // In-flight apply procedures finish under their own ceiling before the
    // agent announces the stop.
    agent.updater.drain().await;
    agent.stop();

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("control surface failed: {e}");
            ExitCode::from(EXIT_INIT)
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).expect("SIGTERM handler installation never fails");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
