//! In-process backend for the store traits.
//!
//! Mirrors the Postgres constraints: unique source URLs, one active schedule
//! per product, cascading product deletes. Nothing survives a restart.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricetrack_core::{
    percent_change, NewProduct, PriceObservation, PricePair, Product, ProductReportRow, Schedule,
    ScheduleState,
};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{DbError, PriceLedgerStore, ProductStore, ScheduleStore, ScheduleTransaction};

#[derive(Debug, Clone)]
struct StoredObservation {
    /// Insertion order; breaks ties between equal timestamps.
    seq: u64,
    observation: PriceObservation,
}

#[derive(Debug, Default)]
struct MemoryState {
    products: Vec<Product>,
    observations: Vec<StoredObservation>,
    schedules: Vec<Schedule>,
    next_seq: u64,
}

impl MemoryState {
    fn has_product(&self, product_id: Uuid) -> bool {
        self.products.iter().any(|p| p.id == product_id)
    }

    fn push_observation(&mut self, observation: PriceObservation) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.observations.push(StoredObservation { seq, observation });
    }

    fn price_pair(&self, product_id: Uuid) -> Option<PricePair> {
        let mut rows: Vec<&StoredObservation> = self
            .observations
            .iter()
            .filter(|o| o.observation.product_id == product_id)
            .collect();
        rows.sort_by(|a, b| {
            b.observation
                .observed_at
                .cmp(&a.observation.observed_at)
                .then(b.seq.cmp(&a.seq))
        });

        let current = rows.first()?;
        let previous = rows
            .iter()
            .find(|o| o.observation.observed_at < current.observation.observed_at);

        Some(PricePair {
            current: current.observation.clone(),
            previous: previous.map(|o| o.observation.clone()),
        })
    }

    fn latest_schedule(&self, product_id: Uuid) -> Option<&Schedule> {
        // Later pushes win ties on created_at.
        self.schedules
            .iter()
            .filter(|s| s.product_id == product_id)
            .fold(None, |latest: Option<&Schedule>, s| match latest {
                Some(l) if l.created_at > s.created_at => Some(l),
                _ => Some(s),
            })
    }

    fn active_schedule_mut(&mut self, product_id: Uuid) -> Option<&mut Schedule> {
        self.schedules
            .iter_mut()
            .find(|s| s.product_id == product_id && s.state.is_active())
    }

    fn check_insertable(&self, schedule: &Schedule) -> Result<(), DbError> {
        if !self.has_product(schedule.product_id) {
            return Err(DbError::ConstraintViolation(format!(
                "product {} does not exist",
                schedule.product_id
            )));
        }
        if schedule.state.is_active()
            && self
                .schedules
                .iter()
                .any(|s| s.product_id == schedule.product_id && s.state.is_active())
        {
            return Err(DbError::ConstraintViolation(format!(
                "product {} already has an active schedule",
                schedule.product_id
            )));
        }
        Ok(())
    }
}

/// Shared in-memory store; clone the `Arc` to hand it to several owners.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProductStore for MemoryStore {
    async fn create_product(&self, product: &NewProduct) -> Result<Product, DbError> {
        let mut state = self.state.lock().await;
        if state.products.iter().any(|p| p.source_url == product.source_url) {
            return Err(DbError::ConstraintViolation(format!(
                "a product with source_url {} already exists",
                product.source_url
            )));
        }

        let created = Product {
            id: Uuid::new_v4(),
            name: product.name.clone(),
            source_url: product.source_url.clone(),
            created_at: product.observed_at,
        };
        state.products.push(created.clone());
        state.push_observation(PriceObservation {
            product_id: created.id,
            price: product.initial_price,
            observed_at: product.observed_at,
        });

        Ok(created)
    }

    async fn product_exists(&self, url: &str) -> Result<bool, DbError> {
        let state = self.state.lock().await;
        Ok(state.products.iter().any(|p| p.source_url == url))
    }

    async fn get_product_by_url(&self, url: &str) -> Result<Option<Product>, DbError> {
        let state = self.state.lock().await;
        Ok(state.products.iter().find(|p| p.source_url == url).cloned())
    }

    async fn get_product(&self, product_id: Uuid) -> Result<Option<Product>, DbError> {
        let state = self.state.lock().await;
        Ok(state.products.iter().find(|p| p.id == product_id).cloned())
    }

    async fn get_product_url_by_id(&self, product_id: Uuid) -> Result<Option<String>, DbError> {
        let state = self.state.lock().await;
        Ok(state
            .products
            .iter()
            .find(|p| p.id == product_id)
            .map(|p| p.source_url.clone()))
    }

    async fn delete_product(&self, product_id: Uuid) -> Result<bool, DbError> {
        let mut state = self.state.lock().await;
        let before = state.products.len();
        state.products.retain(|p| p.id != product_id);
        if state.products.len() == before {
            return Ok(false);
        }
        state
            .observations
            .retain(|o| o.observation.product_id != product_id);
        state.schedules.retain(|s| s.product_id != product_id);
        Ok(true)
    }
}

#[async_trait]
impl PriceLedgerStore for MemoryStore {
    async fn append_observation(
        &self,
        product_id: Uuid,
        price: Decimal,
        observed_at: DateTime<Utc>,
    ) -> Result<PriceObservation, DbError> {
        let mut state = self.state.lock().await;
        if !state.has_product(product_id) {
            return Err(DbError::ConstraintViolation(format!(
                "product {product_id} does not exist"
            )));
        }
        let observation = PriceObservation {
            product_id,
            price,
            observed_at,
        };
        state.push_observation(observation.clone());
        Ok(observation)
    }

    async fn get_current_and_previous(
        &self,
        product_id: Uuid,
    ) -> Result<Option<PricePair>, DbError> {
        let state = self.state.lock().await;
        Ok(state.price_pair(product_id))
    }

    async fn list_all_with_analytics(&self) -> Result<Vec<ProductReportRow>, DbError> {
        let state = self.state.lock().await;

        let mut products: Vec<&Product> = state.products.iter().collect();
        products.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));

        let rows = products
            .into_iter()
            .map(|product| {
                let pair = state.price_pair(product.id);
                let current = pair.as_ref().map(|p| &p.current);
                let previous_price = pair
                    .as_ref()
                    .and_then(|p| p.previous.as_ref())
                    .map(|p| p.price);

                ProductReportRow {
                    id: product.id,
                    name: product.name.clone(),
                    url: product.source_url.clone(),
                    created_at: product.created_at,
                    current_price: current.map(|c| c.price),
                    current_observed_at: current.map(|c| c.observed_at),
                    schedule_state: state.latest_schedule(product.id).map(|s| s.state),
                    previous_price,
                    percent_change: current
                        .map_or(Decimal::ZERO, |c| percent_change(c.price, previous_price)),
                }
            })
            .collect();

        Ok(rows)
    }
}

/// Holds the store lock for its whole lifetime, so no other write can
/// interleave before commit or rollback.
pub struct MemoryScheduleTransaction {
    state: OwnedMutexGuard<MemoryState>,
    staged: Vec<Schedule>,
}

#[async_trait]
impl ScheduleTransaction for MemoryScheduleTransaction {
    async fn add_schedule(&mut self, schedule: &Schedule) -> Result<(), DbError> {
        self.state.check_insertable(schedule)?;
        if schedule.state.is_active()
            && self
                .staged
                .iter()
                .any(|s| s.product_id == schedule.product_id && s.state.is_active())
        {
            return Err(DbError::ConstraintViolation(format!(
                "product {} already has an active schedule",
                schedule.product_id
            )));
        }
        self.staged.push(schedule.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let MemoryScheduleTransaction { mut state, staged } = *self;
        state.schedules.extend(staged);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn begin_transaction(&self) -> Result<Box<dyn ScheduleTransaction>, DbError> {
        let state = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(MemoryScheduleTransaction {
            state,
            staged: Vec::new(),
        }))
    }

    async fn get_schedule(&self, product_id: Uuid) -> Result<Option<Schedule>, DbError> {
        let state = self.state.lock().await;
        Ok(state.latest_schedule(product_id).cloned())
    }

    async fn list_schedules_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<Schedule>, DbError> {
        let state = self.state.lock().await;
        Ok(state
            .schedules
            .iter()
            .filter(|s| s.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn list_schedules_by_state(
        &self,
        wanted: ScheduleState,
    ) -> Result<Vec<Schedule>, DbError> {
        let state = self.state.lock().await;
        Ok(state
            .schedules
            .iter()
            .filter(|s| s.state == wanted)
            .cloned()
            .collect())
    }

    async fn transition_state(
        &self,
        product_id: Uuid,
        from: ScheduleState,
        to: ScheduleState,
    ) -> Result<bool, DbError> {
        let mut state = self.state.lock().await;
        match state
            .schedules
            .iter_mut()
            .find(|s| s.product_id == product_id && s.state == from)
        {
            Some(schedule) => {
                schedule.state = to;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_run(
        &self,
        product_id: Uuid,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        if let Some(schedule) = state.active_schedule_mut(product_id) {
            schedule.last_run = Some(last_run);
            schedule.next_run = next_run;
        }
        Ok(())
    }

    async fn set_next_run(
        &self,
        product_id: Uuid,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        let mut state = self.state.lock().await;
        if let Some(schedule) = state.active_schedule_mut(product_id) {
            schedule.next_run = next_run;
        }
        Ok(())
    }
}
