//! In-memory directory of gateways and workers.
//!
//! A single mutex guards both maps. Reads copy the record out rather than
//! holding the lock across an `.await` point, so the registry is safe to
//! share across the scheduler, reaper, and HTTP handlers via an `Arc`.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The well-known id of the in-process scheduler loop; always considered
/// healthy by the reaper regardless of registry state.
pub const SCHEDULER_WORKER_ID: &str = "skynet-control-scheduler";

fn healthy_gateway_statuses(status: &str) -> bool {
    matches!(status, "online" | "healthy")
}

/// `Value::Null` or an empty object is treated as "no update", matching the
/// source's `dict(metadata or existing.metadata)` falsy-merge semantics.
fn is_falsy_update(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// A remote execution endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub gateway_id: String,
    pub host: String,
    pub capabilities: Vec<String>,
    pub status: String,
    pub metadata: serde_json::Value,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// A participant that may claim tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub worker_id: String,
    pub gateway_id: Option<String>,
    pub capabilities: Vec<String>,
    pub status: String,
    pub capacity: serde_json::Value,
    pub metadata: serde_json::Value,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Combined snapshot used by the `/v1/system-state` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub gateway_count: usize,
    pub worker_count: usize,
    pub gateways: Vec<Gateway>,
    pub workers: Vec<Worker>,
    pub generated_at: DateTime<Utc>,
}

/// Inputs accepted by [`Registry::register_gateway`].
#[derive(Debug, Clone, Default)]
pub struct RegisterGateway {
    pub gateway_id: String,
    pub host: String,
    pub capabilities: Vec<String>,
    pub status: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Inputs accepted by [`Registry::register_worker`].
#[derive(Debug, Clone, Default)]
pub struct RegisterWorker {
    pub worker_id: String,
    pub gateway_id: Option<String>,
    pub capabilities: Vec<String>,
    pub status: Option<String>,
    pub capacity: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Default)]
struct RegistryInner {
    gateways: HashMap<String, Gateway>,
    workers: HashMap<String, Worker>,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gateway, or refresh an existing one in place. Refreshing
    /// preserves `registered_at`.
    pub fn register_gateway(&self, input: RegisterGateway) -> Gateway {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let status = input.status.unwrap_or_else(|| "online".to_owned());

        if let Some(existing) = inner.gateways.get_mut(&input.gateway_id) {
            existing.host = input.host;
            if !input.capabilities.is_empty() {
                existing.capabilities = input.capabilities;
            }
            existing.status = status;
            if let Some(metadata) = input.metadata {
                if !is_falsy_update(&metadata) {
                    existing.metadata = metadata;
                }
            }
            existing.last_heartbeat = now;
            return existing.clone();
        }

        let record = Gateway {
            gateway_id: input.gateway_id.clone(),
            host: input.host,
            capabilities: input.capabilities,
            status,
            metadata: input.metadata.unwrap_or_else(|| serde_json::json!({})),
            registered_at: now,
            last_heartbeat: now,
        };
        inner.gateways.insert(input.gateway_id, record.clone());
        record
    }

    /// Refresh a gateway's heartbeat, optionally updating its status.
    pub fn heartbeat_gateway(&self, gateway_id: &str, status: Option<&str>) -> Option<Gateway> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let record = inner.gateways.get_mut(gateway_id)?;
        record.last_heartbeat = Utc::now();
        if let Some(status) = status {
            record.status = status.to_owned();
        }
        Some(record.clone())
    }

    pub fn register_worker(&self, input: RegisterWorker) -> Worker {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        let status = input.status.unwrap_or_else(|| "online".to_owned());

        if let Some(existing) = inner.workers.get_mut(&input.worker_id) {
            existing.gateway_id = input.gateway_id;
            if !input.capabilities.is_empty() {
                existing.capabilities = input.capabilities;
            }
            existing.status = status;
            if let Some(capacity) = input.capacity {
                if !is_falsy_update(&capacity) {
                    existing.capacity = capacity;
                }
            }
            if let Some(metadata) = input.metadata {
                if !is_falsy_update(&metadata) {
                    existing.metadata = metadata;
                }
            }
            existing.last_heartbeat = now;
            return existing.clone();
        }

        let record = Worker {
            worker_id: input.worker_id.clone(),
            gateway_id: input.gateway_id,
            capabilities: input.capabilities,
            status,
            capacity: input.capacity.unwrap_or_else(|| serde_json::json!({})),
            metadata: input.metadata.unwrap_or_else(|| serde_json::json!({})),
            registered_at: now,
            last_heartbeat: now,
        };
        inner.workers.insert(input.worker_id, record.clone());
        record
    }

    pub fn list_gateways(&self) -> Vec<Gateway> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.gateways.values().cloned().collect()
    }

    pub fn list_workers(&self) -> Vec<Worker> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.workers.values().cloned().collect()
    }

    pub fn get_gateway(&self, gateway_id: &str) -> Option<Gateway> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.gateways.get(gateway_id).cloned()
    }

    pub fn get_worker(&self, worker_id: &str) -> Option<Worker> {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner.workers.get(worker_id).cloned()
    }

    /// Pick a gateway to route to: the preferred one if healthy, else the
    /// most recently heartbeated healthy gateway, else none.
    pub fn select_gateway(&self, preferred_gateway_id: Option<&str>) -> Option<Gateway> {
        let inner = self.inner.lock().expect("registry mutex poisoned");

        if let Some(preferred_id) = preferred_gateway_id {
            if let Some(preferred) = inner.gateways.get(preferred_id) {
                if healthy_gateway_statuses(&preferred.status) {
                    return Some(preferred.clone());
                }
            }
        }

        inner
            .gateways
            .values()
            .filter(|g| healthy_gateway_statuses(&g.status))
            .max_by_key(|g| g.last_heartbeat)
            .cloned()
    }

    /// Whether `worker_id` is considered healthy by the reaper: the
    /// scheduler's own well-known id is always healthy; otherwise the
    /// worker must be registered with a recognized healthy status.
    pub fn worker_is_healthy(&self, worker_id: &str) -> bool {
        if worker_id.to_ascii_lowercase().starts_with(&SCHEDULER_WORKER_ID.to_ascii_lowercase()) {
            return true;
        }
        let inner = self.inner.lock().expect("registry mutex poisoned");
        inner
            .workers
            .get(worker_id)
            .map(|w| matches!(w.status.as_str(), "online" | "healthy" | "running" | "busy"))
            .unwrap_or(false)
    }

    pub fn system_state(&self) -> SystemState {
        let inner = self.inner.lock().expect("registry mutex poisoned");
        let gateways: Vec<Gateway> = inner.gateways.values().cloned().collect();
        let workers: Vec<Worker> = inner.workers.values().cloned().collect();
        SystemState {
            gateway_count: gateways.len(),
            worker_count: workers.len(),
            gateways,
            workers,
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gw(id: &str, status: &str) -> RegisterGateway {
        RegisterGateway {
            gateway_id: id.to_owned(),
            host: format!("http://{id}.example"),
            capabilities: vec![],
            status: Some(status.to_owned()),
            metadata: None,
        }
    }

    #[test]
    fn register_then_reregister_preserves_registered_at() {
        let registry = Registry::new();
        let first = registry.register_gateway(gw("g1", "online"));
        let second = registry.register_gateway(gw("g1", "degraded"));
        assert_eq!(first.registered_at, second.registered_at);
        assert_eq!(second.status, "degraded");
    }

    #[test]
    fn select_prefers_healthy_preferred() {
        let registry = Registry::new();
        registry.register_gateway(gw("g1", "online"));
        registry.register_gateway(gw("g2", "online"));
        let selected = registry.select_gateway(Some("g1")).unwrap();
        assert_eq!(selected.gateway_id, "g1");
    }

    #[test]
    fn select_falls_back_when_preferred_unhealthy() {
        let registry = Registry::new();
        registry.register_gateway(gw("g1", "offline"));
        registry.register_gateway(gw("g2", "online"));
        let selected = registry.select_gateway(Some("g1")).unwrap();
        assert_eq!(selected.gateway_id, "g2");
    }

    #[test]
    fn select_returns_none_when_nothing_healthy() {
        let registry = Registry::new();
        registry.register_gateway(gw("g1", "offline"));
        assert!(registry.select_gateway(None).is_none());
    }

    #[test]
    fn scheduler_worker_is_always_healthy() {
        let registry = Registry::new();
        assert!(registry.worker_is_healthy("skynet-control-scheduler"));
        assert!(registry.worker_is_healthy("SKYNET-CONTROL-SCHEDULER-1"));
    }

    #[test]
    fn unregistered_worker_is_unhealthy() {
        let registry = Registry::new();
        assert!(!registry.worker_is_healthy("ghost"));
    }

    #[test]
    fn reregister_with_empty_metadata_preserves_existing() {
        let registry = Registry::new();
        registry.register_gateway(RegisterGateway {
            gateway_id: "g1".into(),
            host: "http://g1".into(),
            capabilities: vec![],
            status: Some("online".into()),
            metadata: Some(serde_json::json!({"region": "us-east"})),
        });

        let refreshed = registry.register_gateway(RegisterGateway {
            gateway_id: "g1".into(),
            host: "http://g1".into(),
            capabilities: vec![],
            status: Some("online".into()),
            metadata: Some(serde_json::json!({})),
        });

        assert_eq!(refreshed.metadata, serde_json::json!({"region": "us-east"}));
    }

    #[test]
    fn reregister_with_null_metadata_preserves_existing() {
        let registry = Registry::new();
        registry.register_gateway(RegisterGateway {
            gateway_id: "g1".into(),
            host: "http://g1".into(),
            capabilities: vec![],
            status: Some("online".into()),
            metadata: Some(serde_json::json!({"region": "us-east"})),
        });

        let refreshed = registry.register_gateway(RegisterGateway {
            gateway_id: "g1".into(),
            host: "http://g1".into(),
            capabilities: vec![],
            status: Some("online".into()),
            metadata: Some(serde_json::Value::Null),
        });

        assert_eq!(refreshed.metadata, serde_json::json!({"region": "us-east"}));
    }

    #[test]
    fn reregister_with_nonempty_metadata_overwrites_existing() {
        let registry = Registry::new();
        registry.register_gateway(RegisterGateway {
            gateway_id: "g1".into(),
            host: "http://g1".into(),
            capabilities: vec![],
            status: Some("online".into()),
            metadata: Some(serde_json::json!({"region": "us-east"})),
        });

        let refreshed = registry.register_gateway(RegisterGateway {
            gateway_id: "g1".into(),
            host: "http://g1".into(),
            capabilities: vec![],
            status: Some("online".into()),
            metadata: Some(serde_json::json!({"region": "eu-west"})),
        });

        assert_eq!(refreshed.metadata, serde_json::json!({"region": "eu-west"}));
    }

    #[test]
    fn worker_reregister_with_empty_capacity_preserves_existing() {
        let registry = Registry::new();
        registry.register_worker(RegisterWorker {
            worker_id: "w1".into(),
            gateway_id: None,
            capabilities: vec![],
            status: Some("online".into()),
            capacity: Some(serde_json::json!({"slots": 4})),
            metadata: None,
        });

        let refreshed = registry.register_worker(RegisterWorker {
            worker_id: "w1".into(),
            gateway_id: None,
            capabilities: vec![],
            status: Some("online".into()),
            capacity: Some(serde_json::json!({})),
            metadata: None,
        });

        assert_eq!(refreshed.capacity, serde_json::json!({"slots": 4}));
    }
}
