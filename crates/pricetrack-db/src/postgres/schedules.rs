//! `schedules` table operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricetrack_core::{CronExpression, Schedule, ScheduleState};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::PgStore;
use crate::{DbError, ScheduleStore, ScheduleTransaction};

const SCHEDULE_COLUMNS: &str =
    "id, product_id, cron_expression, last_run, next_run, created_at, state";

#[derive(Debug, Clone, sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    product_id: Uuid,
    cron_expression: String,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    state: String,
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = DbError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        let invalid = |e: pricetrack_core::CoreError| DbError::InvalidRow {
            table: "schedules",
            reason: e.to_string(),
        };

        Ok(Schedule {
            id: row.id,
            product_id: row.product_id,
            cron_expression: CronExpression::parse(&row.cron_expression).map_err(invalid)?,
            last_run: row.last_run,
            next_run: row.next_run,
            created_at: row.created_at,
            state: row.state.parse::<ScheduleState>().map_err(invalid)?,
        })
    }
}

/// A schedule write transaction holding its own pooled connection.
///
/// Dropping it without calling `commit` rolls back.
pub struct PgScheduleTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ScheduleTransaction for PgScheduleTransaction {
    async fn add_schedule(&mut self, schedule: &Schedule) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO schedules \
                 (id, product_id, cron_expression, last_run, next_run, created_at, state) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(schedule.id)
        .bind(schedule.product_id)
        .bind(schedule.cron_expression.as_str())
        .bind(schedule.last_run)
        .bind(schedule.next_run)
        .bind(schedule.created_at)
        .bind(schedule.state.as_str())
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.tx
            .commit()
            .await
            .map_err(|source| DbError::Transaction {
                operation: "commit",
                source,
            })
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.tx
            .rollback()
            .await
            .map_err(|source| DbError::Transaction {
                operation: "rollback",
                source,
            })
    }
}

#[async_trait]
impl ScheduleStore for PgStore {
    async fn begin_transaction(&self) -> Result<Box<dyn ScheduleTransaction>, DbError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|source| DbError::Transaction {
                operation: "begin",
                source,
            })?;

        Ok(Box::new(PgScheduleTransaction { tx }))
    }

    async fn get_schedule(&self, product_id: Uuid) -> Result<Option<Schedule>, DbError> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules \
             WHERE product_id = $1 \
             ORDER BY created_at DESC, id DESC \
             LIMIT 1"
        );

        let row = sqlx::query_as::<_, ScheduleRow>(&sql)
            .bind(product_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Schedule::try_from).transpose()
    }

    async fn list_schedules_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<Schedule>, DbError> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules \
             WHERE product_id = $1 \
             ORDER BY created_at, id"
        );

        let rows = sqlx::query_as::<_, ScheduleRow>(&sql)
            .bind(product_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Schedule::try_from).collect()
    }

    async fn list_schedules_by_state(
        &self,
        state: ScheduleState,
    ) -> Result<Vec<Schedule>, DbError> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules \
             WHERE state = $1 \
             ORDER BY created_at, id"
        );

        let rows = sqlx::query_as::<_, ScheduleRow>(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Schedule::try_from).collect()
    }

    async fn transition_state(
        &self,
        product_id: Uuid,
        from: ScheduleState,
        to: ScheduleState,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "UPDATE schedules SET state = $3 \
             WHERE product_id = $1 AND state = $2",
        )
        .bind(product_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_run(
        &self,
        product_id: Uuid,
        last_run: DateTime<Utc>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE schedules SET last_run = $2, next_run = $3 \
             WHERE product_id = $1 AND state IN ('playing', 'paused')",
        )
        .bind(product_id)
        .bind(last_run)
        .bind(next_run)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_next_run(
        &self,
        product_id: Uuid,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE schedules SET next_run = $2 \
             WHERE product_id = $1 AND state IN ('playing', 'paused')",
        )
        .bind(product_id)
        .bind(next_run)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
