use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use pricetrack_core::{PriceObservation, Product, ProductReportRow};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::middleware::RequestId;

use super::{map_tracking_error, ApiError, ApiResponse, AppState, ResponseMeta};

#[derive(Debug, Deserialize)]
pub(super) struct IngestRequest {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub(super) struct IngestItem {
    product: Product,
    observation: PriceObservation,
    created: bool,
}

#[derive(Debug, Serialize)]
pub(super) struct PricesItem {
    product_id: Uuid,
    current: PriceObservation,
    previous: Option<PriceObservation>,
    percent_change: Decimal,
}

pub(super) async fn list_products(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
) -> Result<Json<ApiResponse<Vec<ProductReportRow>>>, ApiError> {
    let data = state
        .service
        .get_report()
        .await
        .map_err(|e| map_tracking_error(req_id.0.clone(), &e))?;

    Ok(Json(ApiResponse {
        data,
        meta: ResponseMeta::new(req_id.0),
    }))
}

pub(super) async fn ingest_product(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Json(body): Json<IngestRequest>,
) -> Result<(StatusCode, Json<ApiResponse<IngestItem>>), ApiError> {
    let url = body.url.trim();
    if url.is_empty() {
        return Err(ApiError::new(req_id.0, "validation_error", "url is required"));
    }

    let outcome = state
        .service
        .ingest_product(url)
        .await
        .map_err(|e| map_tracking_error(req_id.0.clone(), &e))?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(ApiResponse {
            data: IngestItem {
                product: outcome.product,
                observation: outcome.observation,
                created: outcome.created,
            },
            meta: ResponseMeta::new(req_id.0),
        }),
    ))
}

pub(super) async fn get_prices(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(product_id): Path<Uuid>,
) -> Result<Json<ApiResponse<PricesItem>>, ApiError> {
    let pair = state
        .service
        .get_price_pair(product_id)
        .await
        .map_err(|e| map_tracking_error(req_id.0.clone(), &e))?
        .ok_or_else(|| {
            ApiError::new(
                req_id.0.clone(),
                "not_found",
                format!("product {product_id} has no price observations"),
            )
        })?;

    let percent_change = pair.percent_change();
    Ok(Json(ApiResponse {
        data: PricesItem {
            product_id,
            current: pair.current,
            previous: pair.previous,
            percent_change,
        },
        meta: ResponseMeta::new(req_id.0),
    }))
}
