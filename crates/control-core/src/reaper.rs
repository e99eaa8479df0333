//! Stale-lock reaper: scans claimed/running tasks whose lock has outlived
//! its TTL and either hands them back to the queue or fails them outright,
//! depending on whether the worker and gateway that held the lock are
//! still healthy.

use std::sync::Arc;
use std::time::Duration;

use control_db::{queries::tasks, Task};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::gateway_client::{probe_reports_connected, GatewayClient};
use crate::registry::Registry;

pub const DEFAULT_TTL_SECONDS: i64 = 300;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub ttl_seconds: i64,
    pub poll_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_TTL_SECONDS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub async fn run_reaper(
    pool: SqlitePool,
    registry: Arc<Registry>,
    client: Arc<GatewayClient>,
    config: ReaperConfig,
    cancel: CancellationToken,
) {
    tracing::info!(
        ttl_seconds = config.ttl_seconds,
        "stale-lock reaper started"
    );

    loop {
        if cancel.is_cancelled() {
            break;
        }

        if let Err(error) = reap_once(&pool, &registry, &client, config.ttl_seconds).await {
            tracing::error!(error = %error, "stale-lock reaper loop error");
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = cancel.cancelled() => break,
        }
    }

    tracing::info!("stale-lock reaper stopped");
}

async fn reap_once(
    pool: &SqlitePool,
    registry: &Registry,
    client: &GatewayClient,
    ttl_seconds: i64,
) -> anyhow::Result<()> {
    let stale = tasks::list_stale_locked_tasks(pool, ttl_seconds).await?;
    for task in stale {
        handle_stale_task(pool, registry, client, task).await;
    }
    Ok(())
}

async fn handle_stale_task(pool: &SqlitePool, registry: &Registry, client: &GatewayClient, task: Task) {
    let task_id = task.id.clone();
    let worker_id = task.locked_by.clone().unwrap_or_default();
    let claim_token = task.claim_token.clone().unwrap_or_default();
    let gateway_id = task.gateway_id.clone().unwrap_or_default();
    let locked_at = task
        .locked_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    if task_id.is_empty() || worker_id.is_empty() || claim_token.is_empty() {
        return;
    }

    let worker_healthy = registry.worker_is_healthy(&worker_id);
    let gateway_healthy = is_gateway_healthy(registry, client, &gateway_id).await;

    let reason = format!(
        "Stale lock detected by reaper (locked_at={locked_at}, worker_healthy={worker_healthy}, gateway_healthy={gateway_healthy})."
    );

    if worker_healthy && gateway_healthy {
        match tasks::release_claim(pool, &task_id, &worker_id, &claim_token, &reason, true).await {
            Ok(true) => tracing::warn!(task_id = %task_id, "released stale task back to queue"),
            Ok(false) => {}
            Err(error) => tracing::error!(task_id = %task_id, error = %error, "failed to release stale task"),
        }
        return;
    }

    let timeout_reason = format!("failed_timeout: {reason}");
    match tasks::mark_failed_timeout(pool, &task_id, &worker_id, &claim_token, &timeout_reason).await {
        Ok(true) => tracing::warn!(task_id = %task_id, "marked stale task failed_timeout"),
        Ok(false) => {}
        Err(error) => tracing::error!(task_id = %task_id, error = %error, "failed to mark stale task failed_timeout"),
    }
}

async fn is_gateway_healthy(registry: &Registry, client: &GatewayClient, gateway_id: &str) -> bool {
    let gateway = if gateway_id.is_empty() {
        registry.select_gateway(None)
    } else {
        registry.get_gateway(gateway_id)
    };

    let Some(gateway) = gateway else {
        return false;
    };

    if !matches!(gateway.status.as_str(), "online" | "healthy") {
        return false;
    }

    let host = gateway.host.trim();
    if host.is_empty() {
        return false;
    }

    match client.get_status(host).await {
        Ok(status) => probe_reports_connected(&status),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegisterGateway, RegisterWorker};
    use control_db::queries::tasks::EnqueueInput;
    use control_test_utils::create_test_db;

    #[tokio::test]
    async fn fresh_locks_are_left_alone() {
        let pool = create_test_db().await;
        let registry = Registry::new();
        let client = GatewayClient::new();

        let mut input = EnqueueInput::default();
        input.action = "noop".into();
        input.task_id = Some("t1".into());
        tasks::enqueue_task(&pool, input).await.unwrap();
        tasks::claim_next_ready_task(&pool, "worker-1").await.unwrap();

        reap_once(&pool, &registry, &client, 300).await.unwrap();

        let task = tasks::get_task(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(task.status, control_db::TaskStatus::Claimed);
    }

    #[tokio::test]
    async fn stale_lock_with_healthy_worker_and_gateway_is_released() {
        let pool = create_test_db().await;
        let registry = Registry::new();
        let client = GatewayClient::new();

        registry.register_worker(RegisterWorker {
            worker_id: "worker-1".into(),
            gateway_id: None,
            capabilities: vec![],
            status: Some("online".into()),
            capacity: None,
            metadata: None,
        });

        let mut input = EnqueueInput::default();
        input.action = "noop".into();
        input.task_id = Some("t1".into());
        tasks::enqueue_task(&pool, input).await.unwrap();
        let claimed = tasks::claim_next_ready_task(&pool, "worker-1")
            .await
            .unwrap()
            .unwrap();

        handle_stale_task(&pool, &registry, &client, claimed).await;

        let task = tasks::get_task(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(task.status, control_db::TaskStatus::Released);
    }

    #[tokio::test]
    async fn stale_lock_with_unhealthy_worker_fails_timeout() {
        let pool = create_test_db().await;
        let registry = Registry::new();
        let client = GatewayClient::new();

        let mut input = EnqueueInput::default();
        input.action = "noop".into();
        input.task_id = Some("t1".into());
        tasks::enqueue_task(&pool, input).await.unwrap();
        let claimed = tasks::claim_next_ready_task(&pool, "ghost-worker")
            .await
            .unwrap()
            .unwrap();

        handle_stale_task(&pool, &registry, &client, claimed).await;

        let task = tasks::get_task(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(task.status, control_db::TaskStatus::FailedTimeout);
        assert!(task.error.starts_with("failed_timeout: "));
    }

    #[tokio::test]
    async fn scheduler_worker_lock_is_always_treated_as_healthy() {
        let registry = Registry::new();
        assert!(registry.worker_is_healthy("skynet-control-scheduler"));
    }

    #[test]
    fn gateway_health_requires_nonempty_host() {
        let _ = RegisterGateway::default();
    }
}
