mod products;
mod schedules;

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderName, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::middleware::{request_id, RequestId, REQUEST_ID_HEADER};
use crate::tracking::{PriceTrackingService, TrackingError};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PriceTrackingService>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: ErrorBody,
    pub meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct HealthData {
    status: &'static str,
    database: &'static str,
    active_timers: usize,
}

impl ResponseMeta {
    pub(super) fn new(request_id: String) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
        }
    }
}

impl ApiError {
    pub fn new(
        request_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorBody {
                code: code.into(),
                message: message.into(),
            },
            meta: ResponseMeta::new(request_id.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.error.code.as_str() {
            "not_found" => StatusCode::NOT_FOUND,
            "bad_request" | "validation_error" => StatusCode::BAD_REQUEST,
            "conflict" => StatusCode::CONFLICT,
            "bad_gateway" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

pub(super) fn map_tracking_error(request_id: String, error: &TrackingError) -> ApiError {
    if error.is_constraint_violation() {
        return ApiError::new(request_id, "conflict", error.to_string());
    }
    match error {
        TrackingError::NotTracked(_) | TrackingError::ProductNotFound(_) => {
            ApiError::new(request_id, "not_found", error.to_string())
        }
        TrackingError::InvalidTransition { .. } => {
            ApiError::new(request_id, "bad_request", error.to_string())
        }
        TrackingError::Fetch(_) => {
            tracing::warn!(error = %error, "product fetch failed");
            ApiError::new(request_id, "bad_gateway", error.to_string())
        }
        _ => {
            tracing::error!(error = %error, "tracking request failed");
            ApiError::new(request_id, "internal_error", "tracking request failed")
        }
    }
}

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(REQUEST_ID_HEADER)])
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route(
            "/api/v1/products",
            get(products::list_products).post(products::ingest_product),
        )
        .route("/api/v1/products/{id}/prices", get(products::get_prices))
        .route(
            "/api/v1/products/{id}/schedule",
            get(schedules::get_schedule)
                .post(schedules::start_schedule)
                .delete(schedules::stop_schedule),
        )
        .route(
            "/api/v1/products/{id}/schedule/pause",
            post(schedules::pause_schedule),
        )
        .route(
            "/api/v1/products/{id}/schedule/resume",
            post(schedules::resume_schedule),
        )
        .route(
            "/api/v1/products/{id}/schedule/run",
            post(schedules::run_schedule),
        )
        .layer(
            ServiceBuilder::new()
                .layer(build_cors())
                .layer(axum::middleware::from_fn(request_id))
                .layer(TraceLayer::new_for_http()),
        )
        .with_state(state)
}

async fn health(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
) -> impl IntoResponse {
    let meta = ResponseMeta::new(req_id.0);
    let active_timers = state.service.scheduler().registered_ids().await.len();

    match state.service.stores().health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse {
                data: HealthData {
                    status: "ok",
                    database: "ok",
                    active_timers,
                },
                meta,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "health check: database unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse {
                    data: HealthData {
                        status: "degraded",
                        database: "unavailable",
                        active_timers,
                    },
                    meta,
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pricetrack_core::CronExpression;
    use pricetrack_db::Stores;
    use pricetrack_fetcher::{FetchError, FetchedPrice, PriceFetcher};
    use rust_decimal::Decimal;
    use tower::ServiceExt;

    use crate::scheduler::Scheduler;

    /// Every URL costs 12.50 except ones containing "missing".
    struct FixedFetcher;

    #[async_trait]
    impl PriceFetcher for FixedFetcher {
        async fn fetch_current_price(&self, url: &str) -> Result<FetchedPrice, FetchError> {
            if url.contains("missing") {
                return Err(FetchError::NotFound {
                    url: url.to_string(),
                });
            }
            Ok(FetchedPrice {
                name: "Widget".to_string(),
                price: Decimal::new(1250, 2),
            })
        }
    }

    async fn test_app() -> Router {
        let scheduler = Arc::new(Scheduler::new().await.expect("scheduler"));
        let service = Arc::new(PriceTrackingService::new(
            Stores::memory(),
            Arc::new(FixedFetcher),
            scheduler,
            CronExpression::default(),
        ));
        build_app(AppState { service })
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json parse")
        };
        (status, json)
    }

    async fn ingest(app: &Router, url: &str) -> String {
        let (status, json) = send(
            app,
            "POST",
            "/api/v1/products",
            Some(serde_json::json!({"url": url})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "ingest failed: {json}");
        json["data"]["product"]["id"]
            .as_str()
            .expect("product id")
            .to_string()
    }

    #[test]
    fn api_error_codes_map_to_statuses() {
        let cases = [
            ("validation_error", StatusCode::BAD_REQUEST),
            ("not_found", StatusCode::NOT_FOUND),
            ("conflict", StatusCode::CONFLICT),
            ("bad_gateway", StatusCode::BAD_GATEWAY),
            ("internal_error", StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (code, expected) in cases {
            let response = ApiError::new("req-1", code, "msg").into_response();
            assert_eq!(response.status(), expected, "code {code}");
        }
    }

    #[tokio::test]
    async fn health_reports_ok_and_echoes_request_id() {
        let app = test_app().await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/health")
                    .header(REQUEST_ID_HEADER, "req-abc")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("req-abc")
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let json: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["data"]["status"], "ok");
        assert_eq!(json["meta"]["request_id"], "req-abc");
    }

    #[tokio::test]
    async fn ingest_then_list_returns_report_row() {
        let app = test_app().await;
        let id = ingest(&app, "http://shop.test/widget").await;

        let (status, json) = send(&app, "GET", "/api/v1/products", None).await;
        assert_eq!(status, StatusCode::OK);
        let rows = json["data"].as_array().expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], id.as_str());
        assert_eq!(rows[0]["current_price"], "12.50");
        assert_eq!(rows[0]["percent_change"], "0");
        assert!(rows[0]["schedule_state"].is_null());

        // Re-ingesting the same URL appends instead of creating.
        let (status, json) = send(
            &app,
            "POST",
            "/api/v1/products",
            Some(serde_json::json!({"url": "http://shop.test/widget"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["created"], false);
    }

    #[tokio::test]
    async fn ingest_fetch_failure_is_bad_gateway() {
        let app = test_app().await;
        let (status, json) = send(
            &app,
            "POST",
            "/api/v1/products",
            Some(serde_json::json!({"url": "http://shop.test/missing"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"]["code"], "bad_gateway");
    }

    #[tokio::test]
    async fn schedule_lifecycle_over_http() {
        let app = test_app().await;
        let id = ingest(&app, "http://shop.test/lamp").await;
        let schedule_uri = format!("/api/v1/products/{id}/schedule");

        let (status, json) = send(&app, "POST", &schedule_uri, None).await;
        assert_eq!(status, StatusCode::CREATED, "{json}");
        assert_eq!(json["data"]["state"], "playing");
        assert_eq!(json["data"]["cron_expression"], "0 0 * * *");
        assert!(json["data"]["last_run"].is_null());

        let (status, json) = send(&app, "POST", &schedule_uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT, "{json}");

        let (status, json) = send(&app, "POST", &format!("{schedule_uri}/run"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["outcome"], "fired");

        let (status, json) = send(&app, "GET", &schedule_uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["timer_registered"], true);
        assert!(json["data"]["last_run"].is_string());

        let (status, json) = send(&app, "POST", &format!("{schedule_uri}/pause"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["state"], "paused");

        let (status, _) = send(&app, "POST", &format!("{schedule_uri}/run"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "POST", &format!("{schedule_uri}/pause"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = send(&app, "POST", &format!("{schedule_uri}/resume"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["state"], "playing");

        let (status, json) = send(&app, "DELETE", &schedule_uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["state"], "stopped");

        let (status, _) = send(&app, "DELETE", &schedule_uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = send(&app, "GET", &schedule_uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["state"], "stopped");
        assert_eq!(json["data"]["timer_registered"], false);
    }

    #[tokio::test]
    async fn start_schedule_with_custom_and_invalid_cron() {
        let app = test_app().await;
        let id = ingest(&app, "http://shop.test/kettle").await;
        let schedule_uri = format!("/api/v1/products/{id}/schedule");

        let (status, json) = send(
            &app,
            "POST",
            &schedule_uri,
            Some(serde_json::json!({"cron": "61 * * * *"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "validation_error");

        let (status, json) = send(
            &app,
            "POST",
            &schedule_uri,
            Some(serde_json::json!({"cron": "*/15 * * * *"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["data"]["cron_expression"], "*/15 * * * *");
    }

    #[tokio::test]
    async fn unknown_product_routes_are_not_found() {
        let app = test_app().await;
        let ghost = uuid::Uuid::new_v4();

        let uri = format!("/api/v1/products/{ghost}/schedule");
        let (status, _) = send(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let uri = format!("/api/v1/products/{ghost}/prices");
        let (status, _) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn prices_endpoint_returns_current_without_previous() {
        let app = test_app().await;
        let id = ingest(&app, "http://shop.test/chair").await;

        let uri = format!("/api/v1/products/{id}/prices");
        let (status, json) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["current"]["price"], "12.50");
        assert!(json["data"]["previous"].is_null());
        assert_eq!(json["data"]["percent_change"], "0");
    }
}
