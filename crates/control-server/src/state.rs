use std::sync::Arc;

use control_core::{GatewayClient, Registry};
use sqlx::SqlitePool;

use crate::auth::RateLimiter;
use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub registry: Arc<Registry>,
    pub gateway_client: Arc<GatewayClient>,
    pub config: Arc<ServerConfig>,
    pub rate_limiter: Arc<RateLimiter>,
}
