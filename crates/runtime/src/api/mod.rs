//! JSON/HTTP control plane.

pub mod routes;
pub mod server;
pub mod types;

use std::sync::Arc;

use crate::accounts::AccountDirectory;
use crate::config::Config;
use crate::scheduler::engine::SchedulerEngine;
use crate::scheduler::task_store::TaskStore;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TaskStore>,
    pub engine: Arc<SchedulerEngine>,
    pub accounts: AccountDirectory,
    pub config: Arc<Config>,
}

pub use server::{build_router, serve, ServerError};
