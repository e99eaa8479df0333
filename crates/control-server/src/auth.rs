//! Protected-route guard: per-IP rate limiting plus an optional static
//! API key, applied as a `route_layer` middleware ahead of every `/v1`
//! route except `/v1/health`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::AppError;
use crate::state::AppState;

const WINDOW: Duration = Duration::from_secs(60);

/// Fixed-window per-IP request counter, mirroring the source's
/// `(window_start, count)` bucket keyed by client address.
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the request is allowed under `limit` requests per
    /// minute. A non-positive limit disables the check entirely.
    pub fn check(&self, ip: IpAddr, limit: i64) -> bool {
        if limit <= 0 {
            return true;
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        let (window_start, count) = buckets.entry(ip).or_insert((now, 0));

        if now.duration_since(*window_start) >= WINDOW {
            *window_start = now;
            *count = 0;
        }

        *count += 1;
        (*count as i64) <= limit
    }
}

fn extract_token(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        let key = key.trim();
        if !key.is_empty() {
            return Some(key.to_owned());
        }
    }
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(rest) = auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer ")) {
            return Some(rest.trim().to_owned());
        }
    }
    None
}

/// Guard applied to every protected route: rate-limit first, then (when a
/// static API key is configured) require it via `X-API-Key` or a bearer
/// token.
pub async fn require_protected_route_access(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    if !state.rate_limiter.check(addr.ip(), state.config.rate_limit_per_min) {
        return Err(AppError::rate_limited("Rate limit exceeded"));
    }

    if state.config.auth_required() {
        let token = extract_token(request.headers());
        if token.as_deref() != Some(state.config.api_key.as_str()) {
            return Err(AppError::unauthorized("Unauthorized"));
        }
    }

    Ok(next.run(request).await)
}
