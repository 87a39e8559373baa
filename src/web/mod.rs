//! HTTP surface for the UI collaborator.
//!
//! Serves the REST API plus a server-sent-events stream mirroring the
//! event bus. The orchestrator itself lives in `core`; everything here is
//! translation between HTTP and scheduler/inventory operations.

mod error;
mod routes;

use axum::routing::{get, post};
use axum::Router;

pub use error::ApiError;

use crate::context::AppContext;

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route(
            "/api/layout",
            get(routes::get_layout).put(routes::put_layout),
        )
        .route("/api/layout/import", post(routes::import_layout))
        .route("/api/layout/export", get(routes::export_layout))
        .route("/api/drives", get(routes::list_drives))
        .route("/api/ports", get(routes::list_ports))
        .route("/api/ports/physical", get(routes::list_physical_ports))
        .route("/api/images", get(routes::list_images))
        .route("/api/batch/start", post(routes::batch_start))
        .route("/api/batch/cancel", post(routes::batch_cancel))
        .route("/api/batch/retry", post(routes::batch_retry))
        .route("/api/jobs", get(routes::list_jobs))
        .route("/api/jobs/{id}", get(routes::get_job))
        .route("/api/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/api/jobs/{id}/retry", post(routes::retry_job))
        .route("/api/cells/{id}/eject", post(routes::eject_cell))
        .route("/api/events", get(routes::events))
        .with_state(ctx)
}

/// Serve until ctrl-c.
pub async fn serve(ctx: AppContext) -> anyhow::Result<()> {
    let addr = ctx.config.listen;
    let app = router(ctx);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "http surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;
    Ok(())
}
