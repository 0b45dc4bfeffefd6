//! Command handlers for the CLI.
//!
//! Handlers take the composed [`Stores`] so they run against either backend;
//! `main` always hands them the Postgres one.

use anyhow::Context;
use chrono::Utc;
use pricetrack_core::{CronExpression, ProductReportRow, Schedule, ScheduleState};
use pricetrack_db::{RecordedPrice, Stores};
use pricetrack_fetcher::PriceFetcher;
use uuid::Uuid;

/// Fetch `url` and either create the product or append to its ledger.
///
/// # Errors
///
/// Returns an error if the fetch fails or the write is rejected. Nothing is
/// written when the fetch fails.
pub(crate) async fn run_ingest(
    stores: &Stores,
    fetcher: &dyn PriceFetcher,
    url: &str,
) -> anyhow::Result<RecordedPrice> {
    let fetched = fetcher
        .fetch_current_price(url)
        .await
        .with_context(|| format!("failed to fetch {url}"))?;
    let recorded = stores
        .record_price(url, fetched.name, fetched.price, Utc::now())
        .await?;
    if recorded.created {
        tracing::info!(product_id = %recorded.product.id, url, "product created");
    }
    Ok(recorded)
}

/// Persist a new `Playing` schedule inside a transaction.
///
/// # Errors
///
/// Returns an error if the product does not exist or already has an active
/// schedule; the transaction is rolled back in both cases.
pub(crate) async fn run_track(
    stores: &Stores,
    product_id: Uuid,
    cron: CronExpression,
) -> anyhow::Result<Schedule> {
    if stores.products.get_product(product_id).await?.is_none() {
        anyhow::bail!("product {product_id} not found");
    }

    let schedule = Schedule::new_playing(product_id, cron, Utc::now());
    match stores.insert_schedule(&schedule).await {
        Ok(()) => Ok(schedule),
        Err(e) if e.is_constraint_violation() => {
            anyhow::bail!("product {product_id} is already tracked")
        }
        Err(e) => Err(e.into()),
    }
}

/// Move the active schedule to `Stopped`. Returns the state it left.
///
/// # Errors
///
/// Returns an error if the product has no `Playing` or `Paused` schedule.
pub(crate) async fn run_untrack(
    stores: &Stores,
    product_id: Uuid,
) -> anyhow::Result<ScheduleState> {
    let current = stores
        .schedules
        .get_schedule(product_id)
        .await?
        .map(|s| s.state)
        .filter(|state| state.is_active())
        .with_context(|| format!("product {product_id} is not tracked"))?;

    let moved = stores
        .schedules
        .transition_state(product_id, current, ScheduleState::Stopped)
        .await?;
    if !moved {
        anyhow::bail!("schedule for {product_id} changed concurrently; retry");
    }
    Ok(current)
}

pub(crate) fn format_report_row(row: &ProductReportRow) -> String {
    let price = row
        .current_price
        .map_or_else(|| "-".to_string(), |p| p.to_string());
    let previous = row
        .previous_price
        .map_or_else(|| "-".to_string(), |p| p.to_string());
    let state = row
        .schedule_state
        .map_or_else(|| "untracked".to_string(), |s| s.to_string());

    format!(
        "{}  {:<32}  {:>10}  {:>10}  {:>8}%  {:<9}  {}",
        row.id,
        truncate(&row.name, 32),
        price,
        previous,
        row.percent_change.round_dp(2),
        state,
        row.url
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
