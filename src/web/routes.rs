//! Route handlers.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use crate::context::AppContext;
use crate::core::events::Delivery;
use crate::core::image::Image;
use crate::core::inventory::{PhysicalPort, PortLink};
use crate::core::models::{BatchStartRequest, Drive, JobSnapshot};
use crate::layout::LayoutConfig;

// ── Layout ──────────────────────────────────────────────────────────────

pub async fn get_layout(State(ctx): State<AppContext>) -> Result<Json<LayoutConfig>, ApiError> {
    ctx.layout
        .load()
        .map(Json)
        .map_err(|e| ApiError::internal(e.to_string()))
}

pub async fn put_layout(
    State(ctx): State<AppContext>,
    Json(body): Json<Value>,
) -> Result<Json<LayoutConfig>, ApiError> {
    let layout: LayoutConfig = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("invalid layout: {e}")))?;
    layout
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    ctx.layout
        .save(&layout)
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(layout))
}

pub async fn import_layout(
    State(ctx): State<AppContext>,
    mut multipart: Multipart,
) -> Result<Json<LayoutConfig>, ApiError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
        .ok_or_else(|| ApiError::bad_request("missing layout file"))?;
    let raw = field
        .bytes()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    ctx.layout
        .import(&raw)
        .map(Json)
        .map_err(|e| ApiError::bad_request(e.to_string()))
}

pub async fn export_layout(State(ctx): State<AppContext>) -> Result<impl IntoResponse, ApiError> {
    let raw = ctx
        .layout
        .export_bytes()
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"layout.json\"",
            ),
        ],
        raw,
    ))
}

// ── Inventory ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DrivesQuery {
    #[serde(default)]
    removable: u8,
}

pub async fn list_drives(
    State(ctx): State<AppContext>,
    Query(query): Query<DrivesQuery>,
) -> Result<Json<Vec<Drive>>, ApiError> {
    ctx.inventory
        .list_drives(query.removable == 1)
        .await
        .map(Json)
        .map_err(|e| ApiError::internal(e.to_string()))
}

pub async fn list_ports(State(ctx): State<AppContext>) -> Result<Json<Vec<PortLink>>, ApiError> {
    ctx.inventory
        .list_ports()
        .await
        .map(Json)
        .map_err(|e| ApiError::internal(e.to_string()))
}

pub async fn list_physical_ports(
    State(ctx): State<AppContext>,
) -> Result<Json<Vec<PhysicalPort>>, ApiError> {
    ctx.inventory
        .list_physical_ports()
        .await
        .map(Json)
        .map_err(|e| ApiError::internal(e.to_string()))
}

pub async fn list_images(State(ctx): State<AppContext>) -> Result<Json<Vec<Image>>, ApiError> {
    ctx.images
        .list()
        .map(Json)
        .map_err(|e| ApiError::internal(e.to_string()))
}

// ── Batch & jobs ────────────────────────────────────────────────────────

pub async fn batch_start(
    State(ctx): State<AppContext>,
    Json(body): Json<Value>,
) -> Result<Json<Vec<JobSnapshot>>, ApiError> {
    let req: BatchStartRequest = serde_json::from_value(body)
        .map_err(|e| ApiError::bad_request(format!("invalid batch request: {e}")))?;

    // Fail fast on a missing image rather than minting N doomed jobs.
    ctx.images
        .resolve(&req.image_name)
        .map_err(|e| ApiError::not_found(e.message.clone()).with_kind(e.kind.as_str()))?;

    let jobs = ctx.scheduler.start_batch(req).await?;
    Ok(Json(jobs))
}

pub async fn batch_cancel(State(ctx): State<AppContext>) -> StatusCode {
    ctx.scheduler.cancel_all().await;
    StatusCode::NO_CONTENT
}

pub async fn batch_retry(State(ctx): State<AppContext>) -> Json<Vec<JobSnapshot>> {
    Json(ctx.scheduler.retry_failed().await)
}

pub async fn list_jobs(State(ctx): State<AppContext>) -> Json<Vec<JobSnapshot>> {
    Json(ctx.scheduler.table().snapshots().await)
}

pub async fn get_job(
    State(ctx): State<AppContext>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    ctx.scheduler
        .table()
        .snapshot(&job_id, true)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("job not found"))
}

pub async fn cancel_job(
    State(ctx): State<AppContext>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.scheduler.cancel_job(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn retry_job(
    State(ctx): State<AppContext>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError> {
    let job = ctx.scheduler.retry_job(&job_id).await?;
    Ok(Json(job))
}

pub async fn eject_cell(
    State(ctx): State<AppContext>,
    Path(cell_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.scheduler
        .eject_cell(&cell_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(ApiError::bad_request)
}

// ── Events ──────────────────────────────────────────────────────────────

pub async fn events(
    State(ctx): State<AppContext>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscriber = ctx.events.subscribe();
    let stream = futures::stream::unfold(subscriber, |mut subscriber| async move {
        match subscriber.next().await {
            Some(Delivery::Event(event)) => {
                let sse = SseEvent::default()
                    .event(event.name())
                    .data(event.payload().to_string());
                Some((Ok(sse), subscriber))
            }
            Some(Delivery::Lagged(lost)) => {
                let sse = SseEvent::default()
                    .event("resync")
                    .data(json!({ "lost": lost }).to_string());
                Some((Ok(sse), subscriber))
            }
            None => None,
        }
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
