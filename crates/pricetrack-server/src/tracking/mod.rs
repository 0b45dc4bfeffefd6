//! Price tracking orchestration.
//!
//! Owns the schedule state machine and ties the durable schedule rows to the
//! live timers in [`Scheduler`]:
//!
//! - `start_tracking`: insert `Playing` row in a transaction, commit, then
//!   register the timer.
//! - `fire`: one timer tick. Fetch the price, append it, record the run.
//! - `reconcile`: make the set of timers match the `Playing` rows.

mod error;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pricetrack_core::{
    CronExpression, PriceObservation, PricePair, ProductReportRow, Schedule, ScheduleState,
};
use pricetrack_db::{RecordedPrice, Stores};
use pricetrack_fetcher::PriceFetcher;
use uuid::Uuid;

use crate::scheduler::{Scheduler, TickHandler};

pub use error::TrackingError;

/// Result of one firing. Firings never return errors: every failure is
/// logged and folded into one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    Recorded(PriceObservation),
    /// The product no longer resolves to a URL; its schedule was stopped.
    Orphaned,
    /// The product's latest schedule is not `Playing`.
    NotPlaying,
    FetchFailed,
    StoreFailed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub registered: usize,
    pub already_running: usize,
    pub cancelled: usize,
    pub failed: usize,
}

pub struct PriceTrackingService {
    stores: Stores,
    fetcher: Arc<dyn PriceFetcher>,
    scheduler: Arc<Scheduler>,
    default_cron: CronExpression,
}

impl PriceTrackingService {
    #[must_use]
    pub fn new(
        stores: Stores,
        fetcher: Arc<dyn PriceFetcher>,
        scheduler: Arc<Scheduler>,
        default_cron: CronExpression,
    ) -> Self {
        Self {
            stores,
            fetcher,
            scheduler,
            default_cron,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Starts tracking `product_id` on `cron`, or the default cadence.
    ///
    /// # Errors
    ///
    /// - [`TrackingError::ProductNotFound`] if the product does not exist.
    /// - [`TrackingError::Scheduling`] if the schedule row could not be
    ///   written; nothing was persisted and no timer was registered. Carries
    ///   a constraint violation when the product is already tracked.
    /// - [`TrackingError::TimerNotRegistered`] if the row was committed but
    ///   the timer could not be registered.
    pub async fn start_tracking(
        self: &Arc<Self>,
        product_id: Uuid,
        cron: Option<CronExpression>,
    ) -> Result<Schedule, TrackingError> {
        if self.stores.products.get_product(product_id).await?.is_none() {
            return Err(TrackingError::ProductNotFound(product_id));
        }

        let cron = cron.unwrap_or_else(|| self.default_cron.clone());
        let mut schedule = Schedule::new_playing(product_id, cron, Utc::now());

        self.stores
            .insert_schedule(&schedule)
            .await
            .map_err(|source| TrackingError::Scheduling { product_id, source })?;
        tracing::info!(%product_id, cron = %schedule.cron_expression, "tracking: schedule created");

        schedule.next_run = self.register_timer(product_id, &schedule.cron_expression).await?;
        Ok(schedule)
    }

    /// Registers the timer and stores its next tick. Safe to call for a
    /// product that already has a timer.
    async fn register_timer(
        self: &Arc<Self>,
        product_id: Uuid,
        cron: &CronExpression,
    ) -> Result<Option<chrono::DateTime<Utc>>, TrackingError> {
        let handler: Arc<dyn TickHandler> = Arc::clone(self) as Arc<dyn TickHandler>;
        if let Err(source) = self.scheduler.register(product_id, cron, handler).await {
            tracing::error!(
                %product_id,
                error = %source,
                "tracking: schedule committed but timer registration failed"
            );
            return Err(TrackingError::TimerNotRegistered { product_id, source });
        }

        let next_run = self.scheduler.next_run(product_id).await;
        if let Err(e) = self.stores.schedules.set_next_run(product_id, next_run).await {
            tracing::warn!(%product_id, error = %e, "tracking: failed to store next_run");
        }
        Ok(next_run)
    }

    /// Moves the product's schedule to `Stopped` and cancels its timer.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::NotTracked`] if the product has no `Playing`
    /// or `Paused` schedule.
    pub async fn stop_tracking(&self, product_id: Uuid) -> Result<Schedule, TrackingError> {
        self.transition(product_id, ScheduleState::Stopped).await
    }

    /// `Playing → Paused`. The timer is cancelled; the row keeps its cron.
    ///
    /// # Errors
    ///
    /// [`TrackingError::NotTracked`] or [`TrackingError::InvalidTransition`].
    pub async fn pause_tracking(&self, product_id: Uuid) -> Result<Schedule, TrackingError> {
        self.transition(product_id, ScheduleState::Paused).await
    }

    /// `Paused → Playing`, re-registering the timer.
    ///
    /// # Errors
    ///
    /// [`TrackingError::NotTracked`], [`TrackingError::InvalidTransition`], or
    /// [`TrackingError::TimerNotRegistered`] after the state was saved.
    pub async fn resume_tracking(
        self: &Arc<Self>,
        product_id: Uuid,
    ) -> Result<Schedule, TrackingError> {
        let mut schedule = self.transition(product_id, ScheduleState::Playing).await?;
        schedule.next_run = self.register_timer(product_id, &schedule.cron_expression).await?;
        Ok(schedule)
    }

    async fn transition(
        &self,
        product_id: Uuid,
        to: ScheduleState,
    ) -> Result<Schedule, TrackingError> {
        let mut schedule = match self.stores.schedules.get_schedule(product_id).await? {
            Some(s) if s.state.is_active() => s,
            _ => return Err(TrackingError::NotTracked(product_id)),
        };
        let from = schedule.state;
        if !from.can_transition_to(to) {
            return Err(TrackingError::InvalidTransition { from, to });
        }

        if !self
            .stores
            .schedules
            .transition_state(product_id, from, to)
            .await?
        {
            // Changed underneath us.
            return Err(TrackingError::NotTracked(product_id));
        }
        schedule.state = to;

        if to != ScheduleState::Playing {
            if let Err(e) = self.scheduler.cancel(product_id).await {
                tracing::error!(%product_id, error = %e, "tracking: failed to cancel timer");
            }
            if to == ScheduleState::Paused {
                self.stores.schedules.set_next_run(product_id, None).await?;
            }
            schedule.next_run = None;
        }

        tracing::info!(%product_id, %from, %to, "tracking: schedule state changed");
        Ok(schedule)
    }

    /// One firing for `product_id`. Never fails: errors are logged and
    /// reported through the outcome.
    pub async fn fire(&self, product_id: Uuid) -> FireOutcome {
        let url = match self.stores.products.get_product_url_by_id(product_id).await {
            Ok(Some(url)) => url,
            Ok(None) => {
                tracing::warn!(
                    %product_id,
                    "tracking: orphaned schedule; product has no URL, stopping",
                );
                self.stop_orphan(product_id).await;
                return FireOutcome::Orphaned;
            }
            Err(e) => {
                tracing::error!(%product_id, error = %e, "tracking: failed to look up product URL");
                return FireOutcome::StoreFailed;
            }
        };

        // A tick that was already in flight when the schedule was paused or
        // stopped must not record anything.
        match self.stores.schedules.get_schedule(product_id).await {
            Ok(Some(s)) if s.state == ScheduleState::Playing => {}
            Ok(_) => {
                tracing::debug!(%product_id, "tracking: schedule not playing; ignoring tick");
                return FireOutcome::NotPlaying;
            }
            Err(e) => {
                tracing::error!(%product_id, error = %e, "tracking: failed to load schedule");
                return FireOutcome::StoreFailed;
            }
        }

        let fetched = match self.fetcher.fetch_current_price(&url).await {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(
                    %product_id,
                    url,
                    error = %e,
                    "tracking: fetch failed; skipping this firing",
                );
                return FireOutcome::FetchFailed;
            }
        };

        let now = Utc::now();
        let observation = match self
            .stores
            .prices
            .append_observation(product_id, fetched.price, now)
            .await
        {
            Ok(o) => o,
            Err(e) => {
                tracing::error!(%product_id, error = %e, "tracking: failed to append observation");
                return FireOutcome::StoreFailed;
            }
        };

        let next_run = self.scheduler.next_run(product_id).await;
        if let Err(e) = self
            .stores
            .schedules
            .record_run(product_id, now, next_run)
            .await
        {
            tracing::error!(
                %product_id,
                error = %e,
                "tracking: observation saved but last_run not updated",
            );
        }

        tracing::info!(%product_id, price = %observation.price, "tracking: price recorded");
        FireOutcome::Recorded(observation)
    }

    async fn stop_orphan(&self, product_id: Uuid) {
        for from in [ScheduleState::Playing, ScheduleState::Paused] {
            if let Err(e) = self
                .stores
                .schedules
                .transition_state(product_id, from, ScheduleState::Stopped)
                .await
            {
                tracing::error!(
                    %product_id,
                    error = %e,
                    "tracking: failed to stop orphaned schedule",
                );
            }
        }
        if let Err(e) = self.scheduler.cancel(product_id).await {
            tracing::error!(%product_id, error = %e, "tracking: failed to cancel orphaned timer");
        }
    }

    /// Fetches `url` and records its price, creating the product on first
    /// sight.
    ///
    /// # Errors
    ///
    /// - [`TrackingError::Fetch`] if the page cannot be fetched or parsed.
    /// - [`TrackingError::Db`] on store failure, including a constraint
    ///   violation when another caller created the same URL concurrently.
    pub async fn ingest_product(&self, url: &str) -> Result<RecordedPrice, TrackingError> {
        let fetched = self.fetcher.fetch_current_price(url).await?;
        let recorded = self
            .stores
            .record_price(url, fetched.name, fetched.price, Utc::now())
            .await?;
        if recorded.created {
            tracing::info!(product_id = %recorded.product.id, url, "tracking: product created");
        } else {
            tracing::info!(
                product_id = %recorded.product.id,
                price = %recorded.observation.price,
                "tracking: price appended",
            );
        }
        Ok(recorded)
    }

    /// # Errors
    ///
    /// Returns [`TrackingError::Db`] on store failure.
    pub async fn get_report(&self) -> Result<Vec<ProductReportRow>, TrackingError> {
        Ok(self.stores.prices.list_all_with_analytics().await?)
    }

    /// # Errors
    ///
    /// Returns [`TrackingError::ProductNotFound`] if the product does not exist.
    pub async fn get_price_pair(
        &self,
        product_id: Uuid,
    ) -> Result<Option<PricePair>, TrackingError> {
        if self.stores.products.get_product(product_id).await?.is_none() {
            return Err(TrackingError::ProductNotFound(product_id));
        }
        Ok(self.stores.prices.get_current_and_previous(product_id).await?)
    }

    /// The latest schedule for the product, in any state.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::Db`] on store failure.
    pub async fn get_schedule(&self, product_id: Uuid) -> Result<Option<Schedule>, TrackingError> {
        Ok(self.stores.schedules.get_schedule(product_id).await?)
    }

    /// Registers a timer for every `Playing` schedule that lacks one and
    /// cancels timers whose product has no `Playing` schedule.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::Db`] if the `Playing` schedules cannot be
    /// loaded. Per-schedule registration failures are counted, not returned.
    pub async fn reconcile(self: &Arc<Self>) -> Result<ReconcileSummary, TrackingError> {
        let playing = self
            .stores
            .schedules
            .list_schedules_by_state(ScheduleState::Playing)
            .await?;
        let wanted: HashSet<Uuid> = playing.iter().map(|s| s.product_id).collect();
        let mut summary = ReconcileSummary::default();

        for schedule in &playing {
            // Row restarted elsewhere with a new cadence: rebuild its timer.
            if let Some(current) = self.scheduler.cron_for(schedule.product_id).await {
                if current != schedule.cron_expression {
                    tracing::info!(
                        product_id = %schedule.product_id,
                        from = %current,
                        to = %schedule.cron_expression,
                        "tracking: cron changed; replacing timer"
                    );
                    if let Err(e) = self.scheduler.cancel(schedule.product_id).await {
                        summary.failed += 1;
                        tracing::error!(
                            product_id = %schedule.product_id,
                            error = %e,
                            "tracking: reconcile could not cancel timer",
                        );
                        continue;
                    }
                }
            }

            let handler: Arc<dyn TickHandler> = Arc::clone(self) as Arc<dyn TickHandler>;
            match self
                .scheduler
                .register(schedule.product_id, &schedule.cron_expression, handler)
                .await
            {
                Ok(true) => {
                    summary.registered += 1;
                    let next_run = self.scheduler.next_run(schedule.product_id).await;
                    if let Err(e) = self
                        .stores
                        .schedules
                        .set_next_run(schedule.product_id, next_run)
                        .await
                    {
                        tracing::warn!(
                            product_id = %schedule.product_id,
                            error = %e,
                            "tracking: failed to store next_run",
                        );
                    }
                }
                Ok(false) => summary.already_running += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        product_id = %schedule.product_id,
                        error = %e,
                        "tracking: reconcile could not register timer",
                    );
                }
            }
        }

        for product_id in self.scheduler.registered_ids().await {
            if wanted.contains(&product_id) {
                continue;
            }
            match self.scheduler.cancel(product_id).await {
                Ok(true) => summary.cancelled += 1,
                Ok(false) => {}
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        %product_id,
                        error = %e,
                        "tracking: reconcile could not cancel timer",
                    );
                }
            }
        }

        tracing::info!(
            registered = summary.registered,
            already_running = summary.already_running,
            cancelled = summary.cancelled,
            failed = summary.failed,
            "tracking: timers reconciled"
        );
        Ok(summary)
    }
}

#[async_trait]
impl TickHandler for PriceTrackingService {
    async fn on_tick(&self, product_id: Uuid) {
        self.fire(product_id).await;
    }
}

#[cfg(test)]
#[path = "tracking_test.rs"]
mod tests;
