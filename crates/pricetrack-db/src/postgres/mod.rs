//! Postgres backend for the store traits.

mod prices;
mod products;
mod schedules;

use sqlx::PgPool;

pub use schedules::PgScheduleTransaction;

/// Store backed by a shared connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}
