//! Server-level configuration: bind address, API key, and rate limit.
//!
//! Resolved once at startup from the process environment, in the same
//! `from_env`-with-defaults style as [`control_db::config::DbConfig`].

use std::env;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address, e.g. `0.0.0.0:8088`.
    pub bind_addr: String,
    /// Static API key required on protected routes when non-empty.
    pub api_key: String,
    /// Per-IP requests/minute on protected routes. Non-positive disables
    /// the check.
    pub rate_limit_per_min: i64,
}

impl ServerConfig {
    pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8088";
    pub const DEFAULT_RATE_LIMIT_PER_MIN: i64 = 120;

    pub fn from_env() -> Self {
        let bind_addr =
            env::var("CONTROL_BIND_ADDR").unwrap_or_else(|_| Self::DEFAULT_BIND_ADDR.to_owned());
        let api_key = env::var("CONTROL_API_KEY").unwrap_or_default();
        let rate_limit_per_min = env::var("CONTROL_RATE_LIMIT_PER_MIN")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(Self::DEFAULT_RATE_LIMIT_PER_MIN);

        Self {
            bind_addr,
            api_key: api_key.trim().to_owned(),
            rate_limit_per_min,
        }
    }

    pub fn auth_required(&self) -> bool {
        !self.api_key.is_empty()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
