//! Shared axum handler state.

use std::sync::Arc;
use std::time::Duration;

use agent_core::context::CoreContext;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<CoreContext>,
    pub default_approval_expiry: Duration,
}

impl AppState {
    pub fn new(core: Arc<CoreContext>, config: &Config) -> Self {
        Self {
            core,
            default_approval_expiry: config.default_approval_expiry,
        }
    }
}
