use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use pricetrack_core::{CronExpression, Schedule};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::middleware::RequestId;
use crate::scheduler::TickOutcome;
use crate::tracking::TrackingError;

use super::{map_tracking_error, ApiError, ApiResponse, AppState, ResponseMeta};

#[derive(Debug, Default, Deserialize)]
pub(super) struct StartScheduleRequest {
    pub cron: Option<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct ScheduleView {
    #[serde(flatten)]
    schedule: Schedule,
    /// Whether this process currently holds a timer for the product.
    timer_registered: bool,
}

#[derive(Debug, Serialize)]
pub(super) struct RunItem {
    product_id: Uuid,
    outcome: TickOutcome,
}

type ScheduleResult = Result<Json<ApiResponse<Schedule>>, ApiError>;

fn respond(req_id: RequestId, result: Result<Schedule, TrackingError>) -> ScheduleResult {
    let data = result.map_err(|e| map_tracking_error(req_id.0.clone(), &e))?;
    Ok(Json(ApiResponse {
        data,
        meta: ResponseMeta::new(req_id.0),
    }))
}

pub(super) async fn get_schedule(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ApiResponse<ScheduleView>>, ApiError> {
    let schedule = state
        .service
        .get_schedule(product_id)
        .await
        .map_err(|e| map_tracking_error(req_id.0.clone(), &e))?
        .ok_or_else(|| {
            ApiError::new(
                req_id.0.clone(),
                "not_found",
                format!("product {product_id} has never been tracked"),
            )
        })?;
    let timer_registered = state.service.scheduler().is_registered(product_id).await;

    Ok(Json(ApiResponse {
        data: ScheduleView {
            schedule,
            timer_registered,
        },
        meta: ResponseMeta::new(req_id.0),
    }))
}

/// Fires the product's timer now. Skipped if a firing is already running.
pub(super) async fn run_schedule(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ApiResponse<RunItem>>, ApiError> {
    let outcome = state.service.scheduler().trigger(product_id).await;
    if outcome == TickOutcome::NotRegistered {
        return Err(ApiError::new(
            req_id.0,
            "not_found",
            format!("product {product_id} has no running timer"),
        ));
    }

    Ok(Json(ApiResponse {
        data: RunItem {
            product_id,
            outcome,
        },
        meta: ResponseMeta::new(req_id.0),
    }))
}

/// Body is optional; an empty body or a missing `cron` uses the default
/// cadence.
pub(super) async fn start_schedule(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(product_id): Path<Uuid>,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<Schedule>>), ApiError> {
    let request: StartScheduleRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartScheduleRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            ApiError::new(req_id.0.clone(), "validation_error", format!("invalid body: {e}"))
        })?
    };

    let cron = request
        .cron
        .as_deref()
        .map(CronExpression::parse)
        .transpose()
        .map_err(|e| ApiError::new(req_id.0.clone(), "validation_error", e.to_string()))?;

    let result = state.service.start_tracking(product_id, cron).await;
    let Json(response) = respond(req_id, result)?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub(super) async fn stop_schedule(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(product_id): Path<Uuid>,
) -> ScheduleResult {
    let result = state.service.stop_tracking(product_id).await;
    respond(req_id, result)
}

pub(super) async fn pause_schedule(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(product_id): Path<Uuid>,
) -> ScheduleResult {
    let result = state.service.pause_tracking(product_id).await;
    respond(req_id, result)
}

pub(super) async fn resume_schedule(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(product_id): Path<Uuid>,
) -> ScheduleResult {
    let result = state.service.resume_tracking(product_id).await;
    respond(req_id, result)
}
