use std::sync::atomic::Ordering;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AgentError, AgentResult};
use crate::registry::{ContainerRecord, UpdatePhase};
use crate::AppState;

/// Acknowledgement for accepted asynchronous commands. The resulting state
/// change is observable through the event stream only.
#[derive(Serialize, ToSchema)]
pub struct Ack {
    pub accepted: bool,
    pub message: String,
}

fn accepted(message: impl Into<String>) -> (StatusCode, Json<Ack>) {
    (
        StatusCode::ACCEPTED,
        Json(Ack {
            accepted: true,
            message: message.into(),
        }),
    )
}

/// Common gate for container commands: the container must be known, not
/// mid-update, and the runtime reachable, checked in that order so every
/// endpoint reports the same error for the same container state.
fn lifecycle_gate(state: &AppState, id: &str) -> AgentResult<ContainerRecord> {
    let record = state
        .registry
        .get(id)
        .ok_or_else(|| AgentError::NotFound(format!("container {id}")))?;

    if record.update_state.phase == UpdatePhase::Updating {
        return Err(AgentError::Conflict(format!(
            "an update is in flight for {id}"
        )));
    }
    if !state.health.runtime_available.load(Ordering::SeqCst) {
        return Err(AgentError::RuntimeUnavailable(
            "the container runtime is currently unreachable".to_string(),
        ));
    }
    Ok(record)
}

#[utoipa::path(
    get,
    path = "/api/watchtower/containers",
    tag = "containers",
    responses((status = 200, description = "Registry snapshot", body = [ContainerRecord]))
)]
pub async fn list_containers(State(state): State<AppState>) -> Json<Vec<ContainerRecord>> {
    Json(state.registry.snapshot())
}

#[utoipa::path(
    get,
    path = "/api/watchtower/containers/{id}",
    tag = "containers",
    responses(
        (status = 200, description = "One container record", body = ContainerRecord),
        (status = 404, description = "Unknown container", body = crate::error::ErrorBody)
    )
)]
pub async fn get_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AgentResult<Json<ContainerRecord>> {
    state
        .registry
        .get(&id)
        .map(Json)
        .ok_or_else(|| AgentError::NotFound(format!("container {id}")))
}

#[utoipa::path(
    post,
    path = "/api/watchtower/containers/{id}/update",
    tag = "updates",
    responses(
        (status = 202, description = "Update accepted", body = Ack),
        (status = 404, description = "Unknown container", body = crate::error::ErrorBody),
        (status = 409, description = "Update in flight or not replicable", body = crate::error::ErrorBody),
        (status = 503, description = "Runtime unavailable", body = crate::error::ErrorBody)
    )
)]
pub async fn update_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AgentResult<(StatusCode, Json<Ack>)> {
    lifecycle_gate(&state, &id)?;
    state.updater.clone().request_update(&id)?;
    Ok(accepted(format!("update of {id} accepted")))
}

#[utoipa::path(
    post,
    path = "/api/watchtower/containers/{id}/update/dismiss",
    tag = "updates",
    responses(
        (status = 200, description = "Back to idle", body = Ack),
        (status = 404, description = "Unknown container", body = crate::error::ErrorBody),
        (status = 409, description = "Nothing to dismiss", body = crate::error::ErrorBody)
    )
)]
pub async fn dismiss_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AgentResult<Json<Ack>> {
    state.updater.dismiss(&id)?;
    Ok(Json(Ack {
        accepted: true,
        message: format!("update state of {id} reset"),
    }))
}

pub async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AgentResult<(StatusCode, Json<Ack>)> {
    lifecycle_gate(&state, &id)?;

    let runtime = state.runtime.clone();
    let command_id = id.clone();
    tokio::spawn(async move {
        if let Err(e) = runtime.start(&command_id).await {
            log::warn!("start of {command_id} failed: {e}");
        }
    });

    Ok(accepted(format!("start of {id} accepted")))
}

pub async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AgentResult<(StatusCode, Json<Ack>)> {
    lifecycle_gate(&state, &id)?;

    let runtime = state.runtime.clone();
    let grace = state.config.read().unwrap().stop_grace;
    let command_id = id.clone();
    tokio::spawn(async move {
        if let Err(e) = runtime.stop(&command_id, grace).await {
            log::warn!("stop of {command_id} failed: {e}");
        }
    });

    Ok(accepted(format!("stop of {id} accepted")))
}

pub async fn restart_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AgentResult<(StatusCode, Json<Ack>)> {
    lifecycle_gate(&state, &id)?;

    let runtime = state.runtime.clone();
    let grace = state.config.read().unwrap().stop_grace;
    let command_id = id.clone();
    tokio::spawn(async move {
        if let Err(e) = runtime.stop(&command_id, grace).await {
            log::warn!("restart of {command_id}: stop failed: {e}");
            return;
        }
        if let Err(e) = runtime.start(&command_id).await {
            log::warn!("restart of {command_id}: start failed: {e}");
        }
    });

    Ok(accepted(format!("restart of {id} accepted")))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RemoveParams {
    #[serde(default)]
    pub force: bool,
}

pub async fn remove_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<RemoveParams>,
) -> AgentResult<(StatusCode, Json<Ack>)> {
    lifecycle_gate(&state, &id)?;

    let runtime = state.runtime.clone();
    let command_id = id.clone();
    tokio::spawn(async move {
        if let Err(e) = runtime.remove(&command_id, params.force).await {
            log::warn!("removal of {command_id} failed: {e}");
        }
    });

    Ok(accepted(format!("removal of {id} accepted")))
}
