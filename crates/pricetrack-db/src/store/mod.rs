//! Store capabilities shared by every persistence backend.
//!
//! The service layer only sees these traits. A backend is picked once, at
//! composition time, by building a [`Stores`] bundle.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricetrack_core::{
    NewProduct, PriceObservation, PricePair, Product, ProductReportRow, Schedule, ScheduleState,
};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{DbError, MemoryStore, PgStore};

#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Inserts a product and its first price observation atomically.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ConstraintViolation`] if a product with the same
    /// `source_url` already exists.
    async fn create_product(&self, product: &NewProduct) -> Result<Product, DbError>;

    async fn product_exists(&self, url: &str) -> Result<bool, DbError>;

    async fn get_product_by_url(&self, url: &str) -> Result<Option<Product>, DbError>;

    async fn get_product(&self, product_id: Uuid) -> Result<Option<Product>, DbError>;

    async fn get_product_url_by_id(&self, product_id: Uuid) -> Result<Option<String>, DbError>;

    /// Deletes a product. Its observations and schedules are deleted with it.
    ///
    /// Returns `false` if no such product existed.
    async fn delete_product(&self, product_id: Uuid) -> Result<bool, DbError>;
}

#[async_trait]
pub trait PriceLedgerStore: Send + Sync {
    /// Appends one observation. Observations are never updated or deleted
    /// individually.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ConstraintViolation`] if the product does not exist.
    async fn append_observation(
        &self,
        product_id: Uuid,
        price: Decimal,
        observed_at: DateTime<Utc>,
    ) -> Result<PriceObservation, DbError>;

    /// Latest observation plus the latest one with a strictly earlier
    /// timestamp. `None` when the product has no observations at all.
    async fn get_current_and_previous(&self, product_id: Uuid)
        -> Result<Option<PricePair>, DbError>;

    /// One row per product, newest products first.
    async fn list_all_with_analytics(&self) -> Result<Vec<ProductReportRow>, DbError>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Opens a transaction. Writes made through it are invisible to other
    /// callers until committed.
    async fn begin_transaction(&self) -> Result<Box<dyn ScheduleTransaction>, DbError>;

    /// The most recently created schedule for the product, in any state.
    async fn get_schedule(&self, product_id: Uuid) -> Result<Option<Schedule>, DbError>;

    /// Every schedule ever created for the product, oldest first.
    async fn list_schedules_for_product(&self, product_id: Uuid)
        -> Result<Vec<Schedule>, DbError>;

    async fn list_schedules_by_state(&self, state: ScheduleState)
        -> Result<Vec<Schedule>, DbError>;

    /// Moves the product's schedule from `from` to `to`.
    ///
    /// Returns `false` when the product has no schedule in state `from`.
    /// Callers are responsible for checking the transition is legal.
    async fn transition_state(
        &self,
        product_id: Uuid,
        from: ScheduleState,
        to: ScheduleState,
    ) -> Result<bool, DbError>;

    /// Records a completed firing on the product's active schedule.
    async fn record_run(
        &self,
        product_id: Uuid,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), DbError>;

    async fn set_next_run(
        &self,
        product_id: Uuid,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), DbError>;
}

/// Transaction scope for schedule writes. Dropping it without committing
/// discards the writes.
#[async_trait]
pub trait ScheduleTransaction: Send {
    /// # Errors
    ///
    /// Returns [`DbError::ConstraintViolation`] if the product already has a
    /// `Playing` or `Paused` schedule, or the product does not exist.
    async fn add_schedule(&mut self, schedule: &Schedule) -> Result<(), DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    /// Safe to call after a failed write.
    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

/// Result of recording a fetched price for a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPrice {
    pub product: Product,
    pub observation: PriceObservation,
    /// `false` when the URL was already known and only a price was appended.
    pub created: bool,
}

/// The full capability set, backed by one backend.
#[derive(Clone)]
pub struct Stores {
    pub products: Arc<dyn ProductStore>,
    pub prices: Arc<dyn PriceLedgerStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pool: Option<PgPool>,
}

impl Stores {
    #[must_use]
    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool.clone()));
        Self {
            products: store.clone(),
            prices: store.clone(),
            schedules: store,
            pool: Some(pool),
        }
    }

    #[must_use]
    pub fn memory() -> Self {
        Self::from_memory(Arc::new(MemoryStore::new()))
    }

    #[must_use]
    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            products: store.clone(),
            prices: store.clone(),
            schedules: store,
            pool: None,
        }
    }

    /// Creates the product on first sight of `url`, otherwise appends the
    /// price to its ledger. The name is only used on creation.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ConstraintViolation`] if another caller created the
    /// same URL concurrently, or any store error.
    pub async fn record_price(
        &self,
        url: &str,
        name: String,
        price: Decimal,
        observed_at: DateTime<Utc>,
    ) -> Result<RecordedPrice, DbError> {
        if let Some(product) = self.products.get_product_by_url(url).await? {
            let observation = self
                .prices
                .append_observation(product.id, price, observed_at)
                .await?;
            return Ok(RecordedPrice {
                product,
                observation,
                created: false,
            });
        }

        let product = self
            .products
            .create_product(&NewProduct {
                name,
                source_url: url.to_owned(),
                initial_price: price,
                observed_at,
            })
            .await?;
        Ok(RecordedPrice {
            observation: PriceObservation {
                product_id: product.id,
                price,
                observed_at,
            },
            product,
            created: true,
        })
    }

    /// Inserts `schedule` in its own transaction: begin, add, commit. Any
    /// insert error rolls the transaction back before it is returned.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ConstraintViolation`] if the product already has an
    /// active schedule or does not exist, or any transaction error.
    pub async fn insert_schedule(&self, schedule: &Schedule) -> Result<(), DbError> {
        let mut tx = self.schedules.begin_transaction().await?;
        if let Err(e) = tx.add_schedule(schedule).await {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::error!(
                    product_id = %schedule.product_id,
                    error = %rollback_err,
                    "store: rollback after failed schedule insert also failed"
                );
            }
            return Err(e);
        }
        tx.commit().await
    }

    /// Pings the database when one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Sqlx`] if the ping fails.
    pub async fn health_check(&self) -> Result<(), DbError> {
        if let Some(pool) = &self.pool {
            crate::ping(pool).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores")
            .field("backend", &if self.pool.is_some() { "postgres" } else { "memory" })
            .finish_non_exhaustive()
    }
}
