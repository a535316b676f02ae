//! schedd runtime
//!
//! Core of a single-node task scheduler: a durable task catalog over SQLite,
//! a background engine that dispatches tasks by cron time, polled condition,
//! or process lifecycle event, an execution runner that brackets each script
//! in the right operating-system account, and a JSON/HTTP control plane.

pub mod accounts;
pub mod api;
pub mod config;
pub mod scheduler;

pub use accounts::{AccountDirectory, AccountError};
pub use config::{Config, ConfigError};
pub use scheduler::{
    CronError, CronExpression, EngineConfig, EventType, RunStatus, SchedulerEngine, StoreError,
    Task, TaskPayload, TaskResult, TaskRunner, TaskStore, Template, TriggerReason, TriggerType,
    ValidationError,
};
