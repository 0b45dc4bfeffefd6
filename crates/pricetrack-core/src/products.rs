//! Products, the append-only price ledger, and report analytics.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ScheduleState;

/// A product identified by the URL its price is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a product together with its first price observation.
#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub source_url: String,
    pub initial_price: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// One immutable fact: the product had this price at this time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub product_id: Uuid,
    pub price: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// The latest observation and the one before it by distinct timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PricePair {
    pub current: PriceObservation,
    /// `None` when fewer than two distinct timestamps have been observed.
    pub previous: Option<PriceObservation>,
}

impl PricePair {
    #[must_use]
    pub fn percent_change(&self) -> Decimal {
        percent_change(
            self.current.price,
            self.previous.as_ref().map(|p| p.price),
        )
    }
}

/// One row of the product report: identity, latest and previous price, and
/// the schedule state of the most recent schedule (if any).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductReportRow {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub current_price: Option<Decimal>,
    pub current_observed_at: Option<DateTime<Utc>>,
    pub schedule_state: Option<ScheduleState>,
    pub previous_price: Option<Decimal>,
    pub percent_change: Decimal,
}

/// `((current - previous) / previous) * 100`.
///
/// Returns zero when there is no previous price or it is zero, instead of
/// failing on the division.
#[must_use]
pub fn percent_change(current: Decimal, previous: Option<Decimal>) -> Decimal {
    match previous {
        Some(prev) if !prev.is_zero() => (current - prev)
            .checked_div(prev)
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}
