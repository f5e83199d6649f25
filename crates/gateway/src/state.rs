use std::sync::Arc;

use cf_domain::config::Config;
use cf_sessions::SessionCache;

use crate::runtime::TurnEngine;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionCache>,
    pub engine: Arc<TurnEngine>,
}
