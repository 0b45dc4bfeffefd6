pub mod client;
pub mod error;
pub mod parse;
pub(crate) mod rate_limit;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;

pub use client::HttpPriceFetcher;
pub use error::FetchError;
pub use parse::{parse_price, parse_product_page};

/// What one successful fetch reports about a product page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedPrice {
    pub name: String,
    pub price: Decimal,
}

/// Produces the current name and price for a product URL.
///
/// Each call is treated as producing at most one new price fact. Calls may
/// be slow and may fail transiently.
#[async_trait]
pub trait PriceFetcher: Send + Sync {
    async fn fetch_current_price(&self, url: &str) -> Result<FetchedPrice, FetchError>;
}
