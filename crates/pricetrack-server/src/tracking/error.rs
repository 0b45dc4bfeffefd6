use pricetrack_core::ScheduleState;
use pricetrack_db::DbError;
use pricetrack_fetcher::FetchError;
use thiserror::Error;
use tokio_cron_scheduler::JobSchedulerError;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TrackingError {
    /// Creating the schedule row failed and was rolled back.
    #[error("failed to create schedule for product {product_id}: {source}")]
    Scheduling {
        product_id: Uuid,
        #[source]
        source: DbError,
    },

    /// The schedule row is committed but no timer is running for it. The
    /// next reconciliation pass retries the registration.
    #[error("schedule for product {product_id} is saved but its timer was not registered: {source}")]
    TimerNotRegistered {
        product_id: Uuid,
        #[source]
        source: JobSchedulerError,
    },

    #[error("product {0} has no active schedule")]
    NotTracked(Uuid),

    #[error("product {0} not found")]
    ProductNotFound(Uuid),

    #[error("cannot move schedule from {from} to {to}")]
    InvalidTransition {
        from: ScheduleState,
        to: ScheduleState,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl TrackingError {
    /// True when the underlying cause is a uniqueness or reference conflict.
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            TrackingError::Scheduling { source, .. } | TrackingError::Db(source) => {
                source.is_constraint_violation()
            }
            _ => false,
        }
    }
}
