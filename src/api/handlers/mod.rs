pub mod cache;
pub mod health;
pub mod query;
pub mod table;

use std::sync::Arc;

use crate::config::Config;
use crate::services::ExecutionService;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub execution: Arc<ExecutionService>,
}
