//! Schedule records and the tracking state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CoreError, CronExpression};

/// Lifecycle state of a [`Schedule`].
///
/// `Playing` may move to `Paused` or `Stopped`; `Paused` may move back to
/// `Playing` or to `Stopped`; `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleState {
    Playing,
    Paused,
    Stopped,
}

impl ScheduleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleState::Playing => "playing",
            ScheduleState::Paused => "paused",
            ScheduleState::Stopped => "stopped",
        }
    }

    /// Non-terminal states. At most one schedule per product may be active.
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, ScheduleState::Stopped)
    }

    #[must_use]
    pub fn can_transition_to(self, next: ScheduleState) -> bool {
        matches!(
            (self, next),
            (ScheduleState::Playing, ScheduleState::Paused | ScheduleState::Stopped)
                | (ScheduleState::Paused, ScheduleState::Playing | ScheduleState::Stopped)
        )
    }
}

impl std::fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduleState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "playing" => Ok(ScheduleState::Playing),
            "paused" => Ok(ScheduleState::Paused),
            "stopped" => Ok(ScheduleState::Stopped),
            other => Err(CoreError::UnknownScheduleState(other.to_string())),
        }
    }
}

/// Durable description of one recurring refresh job bound to a product.
///
/// The in-process timer is derived from this record and can always be
/// rebuilt from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub product_id: Uuid,
    pub cron_expression: CronExpression,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub state: ScheduleState,
}

impl Schedule {
    /// A fresh schedule as created by a start-tracking request.
    #[must_use]
    pub fn new_playing(
        product_id: Uuid,
        cron_expression: CronExpression,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id,
            cron_expression,
            last_run: None,
            next_run: None,
            created_at: now,
            state: ScheduleState::Playing,
        }
    }
}
