use std::sync::atomic::Ordering;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use super::containers::Ack;
use crate::error::{AgentError, AgentResult};
use crate::runtime::ImageInfo;
use crate::AppState;

fn runtime_gate(state: &AppState) -> AgentResult<()> {
    if !state.health.runtime_available.load(Ordering::SeqCst) {
        return Err(AgentError::RuntimeUnavailable(
            "the container runtime is currently unreachable".to_string(),
        ));
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/api/watchtower/images",
    tag = "images",
    responses(
        (status = 200, description = "Local images", body = [ImageInfo]),
        (status = 503, description = "Runtime unavailable", body = crate::error::ErrorBody)
    )
)]
pub async fn list_images(State(state): State<AppState>) -> AgentResult<Json<Vec<ImageInfo>>> {
    runtime_gate(&state)?;
    let images = state.runtime.image_list().await?;
    Ok(Json(images))
}

#[utoipa::path(
    post,
    path = "/api/watchtower/images/{name}/pull",
    tag = "images",
    responses(
        (status = 202, description = "Pull accepted", body = Ack),
        (status = 503, description = "Runtime unavailable", body = crate::error::ErrorBody)
    )
)]
pub async fn pull_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AgentResult<(StatusCode, Json<Ack>)> {
    runtime_gate(&state)?;

    let runtime = state.runtime.clone();
    let image = name.clone();
    tokio::spawn(async move {
        match runtime.pull(&image).await {
            Ok(digest) => log::info!(
                "pulled {image} ({})",
                digest.as_deref().unwrap_or("no digest")
            ),
            Err(e) => log::warn!("pull of {image} failed: {e}"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(Ack {
            accepted: true,
            message: format!("pull of {name} accepted"),
        }),
    ))
}
