use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use utoipa::ToSchema;

use super::containers::Ack;
use crate::updater::UpdateRecord;
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct HistoryParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[utoipa::path(
    get,
    path = "/api/watchtower/updates",
    tag = "updates",
    params(("limit" = Option<usize>, Query, description = "Maximum records, newest first (1-1000)")),
    responses((status = 200, description = "Update history", body = [UpdateRecord]))
)]
pub async fn update_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Json<Vec<UpdateRecord>> {
    let limit = params.limit.clamp(1, 1000);
    Json(state.updater.history(limit))
}

#[utoipa::path(
    post,
    path = "/api/watchtower/check-updates",
    tag = "updates",
    responses((status = 202, description = "Check sweep scheduled", body = Ack))
)]
pub async fn check_updates(State(state): State<AppState>) -> (StatusCode, Json<Ack>) {
    state.updater.nudge();
    (
        StatusCode::ACCEPTED,
        Json(Ack {
            accepted: true,
            message: "update check scheduled".to_string(),
        }),
    )
}
