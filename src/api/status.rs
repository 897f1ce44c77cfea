use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::runtime::ContainerStatus;
use crate::updater::UpdateOutcome;
use crate::AppState;

#[derive(Serialize, ToSchema)]
pub struct StatusResponse {
    pub status: String,
    pub monitored_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<DateTime<Utc>>,
    pub update_history_count: usize,
    pub started_at: DateTime<Utc>,
}

#[utoipa::path(
    get,
    path = "/api/watchtower/status",
    tag = "agent",
    responses((status = 200, description = "Agent status", body = StatusResponse))
)]
pub async fn agent_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.status_label().to_string(),
        monitored_count: state.registry.len(),
        last_check_at: *state.health.last_check_at.lock().unwrap(),
        update_history_count: state.updater.history_len(),
        started_at: state.health.started_at,
    })
}

#[derive(Serialize, ToSchema)]
pub struct StatsResponse {
    pub total_containers: usize,
    pub running_containers: usize,
    pub stopped_containers: usize,
    pub total_updates: usize,
    pub applied_updates: usize,
    pub failed_updates: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<DateTime<Utc>>,
    pub agent_status: String,
    pub last_event_sequence: u64,
}

#[utoipa::path(
    get,
    path = "/api/watchtower/stats",
    tag = "agent",
    responses((status = 200, description = "Aggregate counters", body = StatsResponse))
)]
pub async fn agent_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let snapshot = state.registry.snapshot();
    let running = snapshot
        .iter()
        .filter(|r| r.status == ContainerStatus::Running)
        .count();
    let stopped = snapshot
        .iter()
        .filter(|r| r.status == ContainerStatus::Exited)
        .count();

    let history = state.updater.history(usize::MAX);
    let applied = history
        .iter()
        .filter(|u| u.outcome == UpdateOutcome::Applied)
        .count();

    Json(StatsResponse {
        total_containers: snapshot.len(),
        running_containers: running,
        stopped_containers: stopped,
        total_updates: history.len(),
        applied_updates: applied,
        failed_updates: history.len() - applied,
        last_check_at: *state.health.last_check_at.lock().unwrap(),
        agent_status: state.status_label().to_string(),
        last_event_sequence: state.bus.last_sequence(),
    })
}
