//! Scheduler loop: claims ready tasks, selects a gateway, dispatches
//! execution, and finalizes the outcome.

use std::sync::Arc;
use std::time::Duration;

use control_db::{queries::tasks, Task};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::gateway_client::{classify_response, ActionRequest, Classification, GatewayClient};
use crate::registry::Registry;

pub const DEFAULT_WORKER_ID: &str = "skynet-control-scheduler";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_id: String,
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_id: DEFAULT_WORKER_ID.to_owned(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Run the scheduler until `cancel` fires. Recovers from unexpected errors
/// by logging and sleeping at least one second before the next attempt.
pub async fn run_scheduler(
    pool: SqlitePool,
    registry: Arc<Registry>,
    client: Arc<GatewayClient>,
    config: SchedulerConfig,
    cancel: CancellationToken,
) {
    tracing::info!(worker_id = %config.worker_id, "control-plane scheduler started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match tasks::claim_next_ready_task(&pool, &config.worker_id).await {
            Ok(Some(task)) => {
                execute_claimed_task(&pool, &registry, &client, &config.worker_id, task).await;
            }
            Ok(None) => {
                tracing::debug!("no ready task");
                sleep_or_cancel(config.poll_interval, &cancel).await;
            }
            Err(error) => {
                tracing::error!(error = %error, "control-plane scheduler loop error");
                sleep_or_cancel(config.poll_interval.max(Duration::from_secs(1)), &cancel).await;
            }
        }
    }

    tracing::info!("control-plane scheduler stopped");
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = cancel.cancelled() => {}
    }
}

async fn execute_claimed_task(
    pool: &SqlitePool,
    registry: &Registry,
    client: &GatewayClient,
    worker_id: &str,
    task: Task,
) {
    let task_id = task.id.clone();
    let claim_token = task.claim_token.clone().unwrap_or_default();

    let gateway = registry.select_gateway(task.gateway_id.as_deref());
    let Some(gateway) = gateway else {
        let _ = tasks::release_claim(
            pool,
            &task_id,
            worker_id,
            &claim_token,
            "No healthy gateway available; task re-queued by control plane.",
            true,
        )
        .await;
        tracing::warn!(task_id = %task_id, "no healthy gateway available, released claim");
        return;
    };

    match tasks::mark_task_running(pool, &task_id, worker_id, &claim_token).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(task_id = %task_id, worker_id, "unable to transition claimed task to running");
            return;
        }
        Err(error) => {
            tracing::error!(task_id = %task_id, error = %error, "failed to mark task running");
            return;
        }
    }

    tracing::info!(task_id = %task_id, gateway_id = %gateway.gateway_id, "task running");

    let request = ActionRequest {
        action: task.action.clone(),
        params: task.params.clone(),
        confirmed: true,
        task_id: Some(task_id.clone()),
        idempotency_key: Some(claim_token.clone()),
    };

    let response = match client.execute_task(&gateway.host, request).await {
        Ok(response) => response,
        Err(error) => {
            let reason = format!("Gateway execution failed ({}): {error}", gateway.host);
            let _ = tasks::release_claim(pool, &task_id, worker_id, &claim_token, &reason, true).await;
            registry.heartbeat_gateway(&gateway.gateway_id, Some("degraded"));
            tracing::warn!(task_id = %task_id, error = %error, "gateway execution failed, released claim");
            return;
        }
    };

    let (success, error_message) = match classify_response(&response) {
        Classification::Success => (true, String::new()),
        Classification::Failure(message) => (false, message),
    };

    match tasks::complete_task(pool, &task_id, worker_id, &claim_token, success, &response, &error_message).await {
        Ok(true) => {
            tracing::info!(task_id = %task_id, success, "task finalized");
        }
        Ok(false) => {
            tracing::warn!(task_id = %task_id, "failed to finalize task due to state transition mismatch");
        }
        Err(error) => {
            tracing::error!(task_id = %task_id, error = %error, "failed to finalize task");
        }
    }

    registry.heartbeat_gateway(
        &gateway.gateway_id,
        Some(if success { "online" } else { "degraded" }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegisterGateway;
    use control_db::queries::tasks::EnqueueInput;
    use control_test_utils::create_test_db;

    #[tokio::test]
    async fn no_healthy_gateway_releases_claim_back_to_released() {
        let pool = create_test_db().await;
        let registry = Registry::new();
        let client = GatewayClient::new();

        let mut input = EnqueueInput::default();
        input.action = "noop".into();
        input.task_id = Some("t1".into());
        tasks::enqueue_task(&pool, input).await.unwrap();

        let claimed = tasks::claim_next_ready_task(&pool, "scheduler-test")
            .await
            .unwrap()
            .unwrap();
        execute_claimed_task(&pool, &registry, &client, "scheduler-test", claimed).await;

        let task = tasks::get_task(&pool, "t1").await.unwrap().unwrap();
        assert_eq!(task.status, control_db::TaskStatus::Released);
    }

    #[tokio::test]
    async fn selected_gateway_is_preferred_when_present() {
        let registry = Registry::new();
        registry.register_gateway(RegisterGateway {
            gateway_id: "g1".into(),
            host: "http://g1".into(),
            capabilities: vec![],
            status: Some("online".into()),
            metadata: None,
        });
        let selected = registry.select_gateway(Some("g1"));
        assert!(selected.is_some());
    }
}
