pub mod config;
pub mod containers;
mod middleware;
pub mod images;
pub mod status;
pub mod updates;
pub mod ws;

pub use middleware::{Principal, PRINCIPAL_HEADER};

use std::future::IntoFuture;

use axum::{middleware as axum_middleware, routing, Json, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

use crate::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Watchtower Agent API",
        description = "Control surface of the container-fleet monitoring and \
                       update-orchestration agent. Mutating operations require a \
                       verified principal forwarded by the boundary in the \
                       x-agent-principal header. Long-running effects are observable \
                       through the event stream on /ws.",
        version = "0.1.0",
        license(name = "MIT")
    ),
    paths(
        status::agent_status,
        status::agent_stats,
        containers::list_containers,
        containers::get_container,
        containers::update_container,
        containers::dismiss_update,
        updates::update_history,
        updates::check_updates,
        config::get_config,
        config::put_config,
        images::list_images,
        images::pull_image,
    ),
    components(schemas(
        status::StatusResponse,
        status::StatsResponse,
        containers::Ack,
        crate::config::AgentConfig,
        crate::config::ConfigUpdate,
        crate::config::LabelFilter,
        crate::error::ErrorBody,
        crate::error::ErrorDetail,
        crate::registry::ContainerRecord,
        crate::registry::UpdatePhase,
        crate::registry::UpdateState,
        crate::runtime::ContainerStatus,
        crate::runtime::ImageInfo,
        crate::runtime::MountSpec,
        crate::runtime::PortMapping,
        crate::updater::UpdateOutcome,
        crate::updater::UpdateRecord,
    )),
    tags(
        (name = "agent", description = "Agent status and counters"),
        (name = "containers", description = "Monitored containers and lifecycle commands"),
        (name = "updates", description = "Update detection, application and history"),
        (name = "config", description = "Agent configuration"),
        (name = "images", description = "Local images")
    )
)]
pub struct ApiDoc;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/status", routing::get(status::agent_status))
        .route("/stats", routing::get(status::agent_stats))
        .route("/containers", routing::get(containers::list_containers))
        .route(
            "/containers/{id}",
            routing::get(containers::get_container).delete(containers::remove_container),
        )
        .route(
            "/containers/{id}/update",
            routing::post(containers::update_container),
        )
        .route(
            "/containers/{id}/update/dismiss",
            routing::post(containers::dismiss_update),
        )
        .route(
            "/containers/{id}/restart",
            routing::post(containers::restart_container),
        )
        .route(
            "/containers/{id}/stop",
            routing::post(containers::stop_container),
        )
        .route(
            "/containers/{id}/start",
            routing::post(containers::start_container),
        )
        .route("/updates", routing::get(updates::update_history))
        .route("/check-updates", routing::post(updates::check_updates))
        .route(
            "/config",
            routing::get(config::get_config).put(config::put_config),
        )
        .route("/images", routing::get(images::list_images))
        .route("/images/{name}/pull", routing::post(images::pull_image))
        .route("/openapi.json", routing::get(openapi_spec))
        .layer(axum_middleware::from_fn(middleware::principal_middleware));

    Router::new()
        .nest("/api/watchtower", api)
        .route("/ws", routing::get(ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve until shutdown is signalled, then drain in-flight requests up to
/// the configured deadline.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let drain_timeout = state.config.read().unwrap().drain_timeout;
    let app = router(state);

    let mut drain_signal = shutdown.clone();
    let mut stop_signal = shutdown;

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop_signal.changed().await;
            log::info!("control surface stopped accepting requests");
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result,
        _ = async {
            let _ = drain_signal.changed().await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            log::warn!(
                "drain deadline of {}s reached, closing remaining connections",
                drain_timeout.as_secs()
            );
            Ok(())
        }
    }
}

async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
