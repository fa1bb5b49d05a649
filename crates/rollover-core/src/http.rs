// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP trigger surface.
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | `POST` | `/api/v1/cron` | rollover for the caller (`x-user-id` header) |
//! | `POST` | `/api/v1/cron/{user_id}` | rollover for any user |
//! | `POST` | `/api/v1/admin/users/{user_id}/unstick-cron` | clear a stuck lease |
//! | `GET` | `/health` | database connectivity |
//!
//! Authentication is left to whatever sits in front of this router.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Serialize;

use crate::cron_handlers::{self, CronHandlerState, RolloverResult};
use crate::error::CoreError;

/// Header carrying the caller's user ID.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Build the router.
pub fn router(state: Arc<CronHandlerState>) -> Router {
    Router::new()
        .route("/api/v1/cron", post(trigger_own))
        .route("/api/v1/cron/{user_id}", post(trigger_for_user))
        .route(
            "/api/v1/admin/users/{user_id}/unstick-cron",
            post(unstick),
        )
        .route("/health", get(health))
        .with_state(state)
}

/// Error body returned for failed requests.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Stable error code.
    pub error_code: &'static str,
    /// Human-readable message.
    pub message: String,
}

/// [`CoreError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::UserNotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::ValidationError { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error_code: self.0.error_code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn trigger_own(
    State(state): State<Arc<CronHandlerState>>,
    headers: HeaderMap,
) -> Result<Json<RolloverResult>, ApiError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| CoreError::ValidationError {
            field: USER_ID_HEADER.to_string(),
            message: "header is required".to_string(),
        })?;
    let result = cron_handlers::trigger_rollover(&state, user_id, Utc::now()).await?;
    Ok(Json(result))
}

async fn trigger_for_user(
    State(state): State<Arc<CronHandlerState>>,
    Path(user_id): Path<String>,
) -> Result<Json<RolloverResult>, ApiError> {
    let result = cron_handlers::trigger_rollover(&state, &user_id, Utc::now()).await?;
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
struct UnstickResponse {
    user_id: String,
    released: bool,
}

async fn unstick(
    State(state): State<Arc<CronHandlerState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UnstickResponse>, ApiError> {
    let released = cron_handlers::unstick_cron(&state, &user_id).await?;
    Ok(Json(UnstickResponse { user_id, released }))
}

async fn health(State(state): State<Arc<CronHandlerState>>) -> impl IntoResponse {
    match state.persistence.health_check_db().await {
        Ok(true) => (StatusCode::OK, "OK"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "database unavailable"),
    }
}
