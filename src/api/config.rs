use axum::extract::State;
use axum::Json;

use crate::config::{AgentConfig, ConfigUpdate};
use crate::error::{AgentError, AgentResult};
use crate::AppState;

#[utoipa::path(
    get,
    path = "/api/watchtower/config",
    tag = "config",
    responses((status = 200, description = "Current configuration", body = AgentConfig))
)]
pub async fn get_config(State(state): State<AppState>) -> Json<AgentConfig> {
    Json(state.config.read().unwrap().clone())
}

#[utoipa::path(
    put,
    path = "/api/watchtower/config",
    tag = "config",
    request_body = ConfigUpdate,
    responses(
        (status = 200, description = "Configuration after the update", body = AgentConfig),
        (status = 400, description = "Validation failed", body = crate::error::ErrorBody)
    )
)]
pub async fn put_config(
    State(state): State<AppState>,
    Json(patch): Json<ConfigUpdate>,
) -> AgentResult<Json<AgentConfig>> {
    let current = state.config.read().unwrap().clone();
    let next = patch
        .apply_to(&current)
        .map_err(|fields| AgentError::InvalidConfig(fields.join("; ")))?;

    if next.event_buffer_size != current.event_buffer_size
        || next.max_parallel_updates != current.max_parallel_updates
    {
        // The ring and the apply worker pool are sized at startup.
        log::warn!(
            "event_buffer_size/max_parallel_updates accepted, takes effect at next start"
        );
    }

    *state.config.write().unwrap() = next.clone();
    log::info!("configuration updated");
    Ok(Json(next))
}
