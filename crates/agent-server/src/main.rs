//! Entry point: boots the agent core, registers the built-in task
//! capabilities, and serves the RPC surface.

mod config;
mod rpc;
mod state;

use std::sync::Arc;

use agent_core::context::{CoreConfig, CoreContext};
use agent_core::sync::{HttpSyncBridge, NullSyncBridge, SyncBridge, SyncConfig};
use agent_core::task::TaskRegistry;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();

    let sync: Arc<dyn SyncBridge> = if config.sync_enabled {
        Arc::new(HttpSyncBridge::new(SyncConfig {
            base_url: config.remote_store_base_url(),
            request_timeout: std::time::Duration::from_secs(10),
        })?)
    } else {
        Arc::new(NullSyncBridge)
    };

    // Task capabilities (ebook generation, writing assistance, ...) are
    // deployment-specific and registered by whatever binary embeds this
    // crate for a given experiment catalog; this server ships with none
    // wired in by default.
    let tasks = TaskRegistry::new();

    let core = Arc::new(
        CoreContext::build(
            CoreConfig {
                worker_pool_width: config.worker_pool_width,
                ticker_interval: config.ticker_interval,
                housekeeping_interval: std::time::Duration::from_secs(30),
            },
            tasks,
            sync,
        )
        .await,
    );

    let state = AppState::new(core, &config);
    rpc::run_serve(state, config.bind_port).await
}
