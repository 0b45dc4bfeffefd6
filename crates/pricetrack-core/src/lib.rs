pub mod app_config;
pub mod config;
pub mod cron;
pub mod products;
pub mod schedules;

use thiserror::Error;

pub use app_config::{AppConfig, Environment, StoreBackend};
pub use config::{load_app_config, load_app_config_from_env};
pub use cron::{CronExpression, DEFAULT_CRON_EXPRESSION};
pub use products::{
    percent_change, NewProduct, PriceObservation, PricePair, Product, ProductReportRow,
};
pub use schedules::{Schedule, ScheduleState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid cron expression \"{expression}\": {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("unknown schedule state: {0}")]
    UnknownScheduleState(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}
