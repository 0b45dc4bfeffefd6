//! `price_observations` ledger and the product report query.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricetrack_core::{
    percent_change, PriceObservation, PricePair, ProductReportRow, ScheduleState,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::PgStore;
use crate::{DbError, PriceLedgerStore};

/// Ranks observations per product: `ts_rank` counts distinct timestamps
/// from newest, `tie_rank` picks the newest insert among equal timestamps.
const RANKED_OBSERVATIONS: &str = "ranked AS ( \
         SELECT product_id, price, observed_at, \
                DENSE_RANK() OVER (PARTITION BY product_id ORDER BY observed_at DESC) AS ts_rank, \
                ROW_NUMBER() OVER (PARTITION BY product_id, observed_at ORDER BY id DESC) AS tie_rank \
         FROM price_observations \
     )";

#[derive(Debug, sqlx::FromRow)]
struct PricePairRow {
    price: Decimal,
    observed_at: DateTime<Utc>,
    previous_price: Option<Decimal>,
    previous_observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct ReportRow {
    id: Uuid,
    name: String,
    source_url: String,
    created_at: DateTime<Utc>,
    current_price: Option<Decimal>,
    current_observed_at: Option<DateTime<Utc>>,
    previous_price: Option<Decimal>,
    schedule_state: Option<String>,
}

impl TryFrom<ReportRow> for ProductReportRow {
    type Error = DbError;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        let schedule_state = row
            .schedule_state
            .map(|s| s.parse::<ScheduleState>())
            .transpose()
            .map_err(|e| DbError::InvalidRow {
                table: "schedules",
                reason: e.to_string(),
            })?;

        let percent_change = row
            .current_price
            .map_or(Decimal::ZERO, |current| percent_change(current, row.previous_price));

        Ok(ProductReportRow {
            id: row.id,
            name: row.name,
            url: row.source_url,
            created_at: row.created_at,
            current_price: row.current_price,
            current_observed_at: row.current_observed_at,
            schedule_state,
            previous_price: row.previous_price,
            percent_change,
        })
    }
}

#[async_trait]
impl PriceLedgerStore for PgStore {
    async fn append_observation(
        &self,
        product_id: Uuid,
        price: Decimal,
        observed_at: DateTime<Utc>,
    ) -> Result<PriceObservation, DbError> {
        let (price, observed_at) = sqlx::query_as::<_, (Decimal, DateTime<Utc>)>(
            "INSERT INTO price_observations (product_id, price, observed_at) \
             VALUES ($1, $2, $3) \
             RETURNING price, observed_at",
        )
        .bind(product_id)
        .bind(price)
        .bind(observed_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(PriceObservation {
            product_id,
            price,
            observed_at,
        })
    }

    async fn get_current_and_previous(
        &self,
        product_id: Uuid,
    ) -> Result<Option<PricePair>, DbError> {
        let sql = format!(
            "WITH {RANKED_OBSERVATIONS} \
             SELECT cur.price, cur.observed_at, \
                    prev.price AS previous_price, prev.observed_at AS previous_observed_at \
             FROM ranked cur \
             LEFT JOIN ranked prev \
               ON prev.product_id = cur.product_id AND prev.ts_rank = 2 AND prev.tie_rank = 1 \
             WHERE cur.product_id = $1 AND cur.ts_rank = 1 AND cur.tie_rank = 1"
        );

        let row = sqlx::query_as::<_, PricePairRow>(&sql)
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| PricePair {
            current: PriceObservation {
                product_id,
                price: row.price,
                observed_at: row.observed_at,
            },
            previous: row
                .previous_price
                .zip(row.previous_observed_at)
                .map(|(price, observed_at)| PriceObservation {
                    product_id,
                    price,
                    observed_at,
                }),
        }))
    }

    async fn list_all_with_analytics(&self) -> Result<Vec<ProductReportRow>, DbError> {
        let sql = format!(
            "WITH {RANKED_OBSERVATIONS} \
             SELECT p.id, p.name, p.source_url, p.created_at, \
                    cur.price AS current_price, cur.observed_at AS current_observed_at, \
                    prev.price AS previous_price, \
                    s.state AS schedule_state \
             FROM products p \
             LEFT JOIN ranked cur \
               ON cur.product_id = p.id AND cur.ts_rank = 1 AND cur.tie_rank = 1 \
             LEFT JOIN ranked prev \
               ON prev.product_id = p.id AND prev.ts_rank = 2 AND prev.tie_rank = 1 \
             LEFT JOIN LATERAL ( \
                 SELECT state FROM schedules \
                 WHERE product_id = p.id \
                 ORDER BY created_at DESC, id DESC \
                 LIMIT 1 \
             ) s ON TRUE \
             ORDER BY p.created_at DESC, p.id"
        );

        let rows = sqlx::query_as::<_, ReportRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ProductReportRow::try_from).collect()
    }
}
