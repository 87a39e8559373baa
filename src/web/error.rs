//! API error envelope: `{detail, kind?}` with a small status map.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::core::scheduler::SchedulerError;

pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
    pub kind: Option<&'static str>,
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
            kind: None,
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
            kind: None,
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: &'static str) -> Self {
        self.kind = Some(kind);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "detail": self.detail });
        if let Some(kind) = self.kind {
            body["kind"] = kind.into();
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        let detail = err.to_string();
        match err {
            SchedulerError::CellBusy(_) => Self {
                status: StatusCode::CONFLICT,
                detail,
                kind: None,
            },
            SchedulerError::JobNotFound
            | SchedulerError::NotCancellable
            | SchedulerError::NotRetryable => Self::not_found(detail),
            SchedulerError::Internal(_) => Self::internal(detail),
        }
    }
}
