//! Server configuration, loaded entirely from the environment. There is
//! no config file and no CLI flag surface; every value has a sane
//! default so the agent boots clean in a container with nothing set.

use std::time::Duration;

/// Parse an env var with a default, logging what was picked when the
/// value came from the environment rather than the fallback.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => value.parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_port: u16,
    pub remote_store_host: String,
    pub remote_store_port: u16,
    pub sync_enabled: bool,
    pub worker_pool_width: usize,
    pub default_approval_expiry: Duration,
    pub ticker_interval: Duration,
    pub root_ca_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_port: env_or("AGENT_PORT", 50051),
            remote_store_host: std::env::var("AGENT_REMOTE_STORE_HOST").unwrap_or_else(|_| "localhost".to_string()),
            remote_store_port: env_or("AGENT_REMOTE_STORE_PORT", 50052),
            sync_enabled: env_or("AGENT_SYNC_ENABLED", true),
            worker_pool_width: env_or("AGENT_WORKER_POOL_WIDTH", 5),
            default_approval_expiry: Duration::from_secs(env_or("AGENT_APPROVAL_EXPIRY_SECONDS", 24 * 60 * 60)),
            ticker_interval: Duration::from_secs(env_or("AGENT_TICKER_INTERVAL_SECONDS", 5)),
            root_ca_path: std::env::var("AGENT_ROOT_CA_PATH").ok(),
        }
    }

    pub fn remote_store_base_url(&self) -> String {
        format!("https://{}:{}", self.remote_store_host, self.remote_store_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_any_env_set() {
        // Reading real process env here would be flaky under parallel test
        // execution; exercise the parsing helper directly instead.
        assert_eq!(env_or::<u16>("AGENT_PORT_DOES_NOT_EXIST", 50051), 50051);
    }

    #[test]
    fn remote_store_base_url_is_https() {
        let config = Config {
            bind_port: 50051,
            remote_store_host: "store.internal".into(),
            remote_store_port: 50052,
            sync_enabled: true,
            worker_pool_width: 5,
            default_approval_expiry: Duration::from_secs(60),
            ticker_interval: Duration::from_secs(5),
            root_ca_path: None,
        };
        assert_eq!(config.remote_store_base_url(), "https://store.internal:50052");
    }
}
