use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use control_db::queries::tasks;

use crate::auth::require_protected_route_access;
use crate::dto::*;
use crate::error::AppError;
use crate::state::AppState;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/register-gateway", post(register_gateway))
        .route("/v1/register-worker", post(register_worker))
        .route("/v1/route-task", post(route_task))
        .route("/v1/system-state", get(get_system_state))
        .route("/v1/tasks/enqueue", post(enqueue_task))
        .route("/v1/tasks/claim", post(claim_task))
        .route("/v1/tasks/next", get(next_task))
        .route("/v1/tasks/{id}/start", post(start_task))
        .route("/v1/tasks/{id}/complete", post(complete_task))
        .route("/v1/tasks/{id}/release", post(release_task))
        .route("/v1/tasks", get(list_tasks))
        .route("/v1/file-ownership", get(list_file_ownership))
        .route("/v1/file-ownership/claim", post(claim_file))
        .route("/v1/agents", get(list_agents))
        .route("/v1/events", get(list_events))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_protected_route_access,
        ));

    Router::new()
        .merge(protected)
        .route("/v1/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Registry endpoints
// ---------------------------------------------------------------------------

async fn register_gateway(
    State(state): State<AppState>,
    Json(req): Json<RegisterGatewayRequest>,
) -> Result<Response, AppError> {
    let mut resolved_status = req.status.clone().unwrap_or_else(|| "online".to_owned());
    match state.gateway_client.get_status(&req.host).await {
        Ok(status) => {
            if !control_core::gateway_client::probe_reports_connected(&status) {
                resolved_status = "degraded".to_owned();
            }
        }
        Err(error) => {
            tracing::warn!(gateway_id = %req.gateway_id, error = %error, "gateway status probe failed");
            resolved_status = "offline".to_owned();
        }
    }

    let record = state.registry.register_gateway(control_core::RegisterGateway {
        gateway_id: req.gateway_id,
        host: req.host,
        capabilities: req.capabilities,
        status: Some(resolved_status),
        metadata: req.metadata,
    });

    Ok(Json(record).into_response())
}

/// Infrastructure-level ledger mirror for worker registrations. Every
/// worker this control plane dispatches to arrives through its gateway's
/// own agent, so there's only ever one provider to mirror under.
const MIRROR_PROVIDER_NAME: &str = "openclaw";

async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<Response, AppError> {
    let record = state.registry.register_worker(control_core::RegisterWorker {
        worker_id: req.worker_id.clone(),
        gateway_id: req.gateway_id.clone(),
        capabilities: req.capabilities.clone(),
        status: req.status,
        capacity: req.capacity.clone(),
        metadata: req.metadata.clone(),
    });

    let mut mirror_metadata = req.metadata.unwrap_or_else(|| serde_json::json!({}));
    if let Some(object) = mirror_metadata.as_object_mut() {
        object.insert("gateway_id".to_owned(), serde_json::json!(req.gateway_id));
        object.insert("capacity".to_owned(), req.capacity.unwrap_or(serde_json::Value::Null));
    }

    if let Err(error) = tasks::upsert_worker_mirror(
        &state.pool,
        &req.worker_id,
        MIRROR_PROVIDER_NAME,
        &record.status,
        &req.capabilities,
        &mirror_metadata,
    )
    .await
    {
        tracing::warn!(worker_id = %req.worker_id, error = %error, "failed to mirror worker registration to ledger");
    }

    Ok(Json(record).into_response())
}

async fn route_task(
    State(state): State<AppState>,
    Json(req): Json<RouteTaskRequest>,
) -> Result<Response, AppError> {
    let gateway = state
        .registry
        .select_gateway(req.gateway_id.as_deref())
        .ok_or_else(|| AppError::unavailable("No healthy gateway available"))?;

    let status_data = match state.gateway_client.get_status(&gateway.host).await {
        Ok(data) => data,
        Err(error) => {
            state.registry.heartbeat_gateway(&gateway.gateway_id, Some("offline"));
            return Err(AppError::unavailable(format!(
                "Gateway {} unreachable: {error}",
                gateway.gateway_id
            )));
        }
    };

    if !control_core::gateway_client::probe_reports_connected(&status_data) {
        state.registry.heartbeat_gateway(&gateway.gateway_id, Some("degraded"));
        return Err(AppError::unavailable(format!(
            "Gateway {} is online but has no connected agent",
            gateway.gateway_id
        )));
    }

    let action_request = control_core::ActionRequest {
        action: req.action.clone(),
        params: req.params.clone(),
        confirmed: req.confirmed,
        task_id: req.task_id.clone(),
        idempotency_key: None,
    };

    let result = match state.gateway_client.execute_task(&gateway.host, action_request).await {
        Ok(result) => {
            state.registry.heartbeat_gateway(&gateway.gateway_id, Some("online"));
            result
        }
        Err(error) => {
            state.registry.heartbeat_gateway(&gateway.gateway_id, Some("degraded"));
            return Err(AppError::bad_gateway(format!(
                "Gateway {} execution failed: {error}",
                gateway.gateway_id
            )));
        }
    };

    let task_id = req
        .task_id
        .unwrap_or_else(|| format!("task-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]));
    let status = result
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_owned();

    Ok(Json(RouteTaskResponse {
        task_id,
        gateway_id: gateway.gateway_id,
        gateway_host: gateway.host,
        status,
        result,
    })
    .into_response())
}

async fn get_system_state(State(state): State<AppState>) -> Response {
    Json(state.registry.system_state()).into_response()
}

// ---------------------------------------------------------------------------
// Task queue endpoints
// ---------------------------------------------------------------------------

async fn enqueue_task(
    State(state): State<AppState>,
    Json(req): Json<QueueTaskRequest>,
) -> Result<Response, AppError> {
    let task = tasks::enqueue_task(&state.pool, req.into())
        .await
        .map_err(|e| AppError::bad_request(format!("{e:#}")))?;
    Ok(Json(QueueTaskResponse { task }).into_response())
}

async fn claim_task(
    State(state): State<AppState>,
    Json(req): Json<ClaimTaskRequest>,
) -> Result<Response, AppError> {
    let task = tasks::claim_next_ready_task(&state.pool, &req.worker_id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(ClaimTaskResponse {
        claimed: task.is_some(),
        task,
    })
    .into_response())
}

async fn next_task(
    State(state): State<AppState>,
    Query(query): Query<NextTaskQuery>,
) -> Result<Response, AppError> {
    let task = tasks::peek_next_ready_task(&state.pool)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(NextTaskResponse {
        eligible: task.is_some(),
        agent_id: query.agent_id,
        task,
    })
    .into_response())
}

async fn start_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(req): Json<StartTaskRequest>,
) -> Result<Response, AppError> {
    let ok = tasks::mark_task_running(&state.pool, &task_id, &req.worker_id, &req.claim_token)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(TaskMutationResponse { ok }).into_response())
}

async fn complete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(req): Json<CompleteTaskRequest>,
) -> Result<Response, AppError> {
    let ok = tasks::complete_task(
        &state.pool,
        &task_id,
        &req.worker_id,
        &req.claim_token,
        req.success,
        &req.result,
        &req.error,
    )
    .await
    .map_err(AppError::internal)?;
    Ok(Json(TaskMutationResponse { ok }).into_response())
}

async fn release_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(req): Json<ReleaseTaskRequest>,
) -> Result<Response, AppError> {
    let ok = tasks::release_claim(
        &state.pool,
        &task_id,
        &req.worker_id,
        &req.claim_token,
        &req.reason,
        req.back_to_pending,
    )
    .await
    .map_err(AppError::internal)?;
    Ok(Json(TaskMutationResponse { ok }).into_response())
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Response, AppError> {
    let limit = query.limit.unwrap_or(100);
    let tasks = tasks::list_tasks(&state.pool, query.status.as_deref(), limit)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(TaskListResponse { tasks }).into_response())
}

async fn list_file_ownership(State(state): State<AppState>) -> Result<Response, AppError> {
    let ownership = tasks::list_file_ownership(&state.pool)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(FileOwnershipResponse { ownership }).into_response())
}

async fn claim_file(
    State(state): State<AppState>,
    Json(req): Json<ClaimFileRequest>,
) -> Result<Response, AppError> {
    let (ok, owner_task_id) = tasks::claim_file(&state.pool, &req.task_id, &req.claim_token, &req.file_path)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(ClaimFileResponse { ok, owner_task_id }).into_response())
}

async fn list_agents(State(state): State<AppState>) -> Result<Response, AppError> {
    let agents = tasks::list_active_assignments(&state.pool, 500)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(AgentListResponse { agents }).into_response())
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Response, AppError> {
    let limit = query.limit.unwrap_or(200);
    let events = tasks::list_task_events(&state.pool, query.task_id.as_deref(), query.since, limit)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(EventListResponse { events }).into_response())
}

async fn health_check() -> Response {
    let mut components = BTreeMap::new();
    components.insert("control_registry".to_owned(), "ok".to_owned());
    components.insert("gateway_client".to_owned(), "ok".to_owned());

    Json(HealthResponse {
        status: "ok".to_owned(),
        version: SERVER_VERSION.to_owned(),
        components,
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::auth::RateLimiter;
    use crate::config::ServerConfig;
    use control_core::{GatewayClient, Registry};
    use control_db::config::DbConfig;
    use control_db::pool::{create_pool, run_migrations};

    async fn test_state() -> AppState {
        let pool = create_pool(&DbConfig::in_memory()).await.unwrap();
        run_migrations(&pool, control_db::pool::default_migrations_path())
            .await
            .unwrap();
        AppState {
            pool,
            registry: Arc::new(Registry::new()),
            gateway_client: Arc::new(GatewayClient::new()),
            config: Arc::new(ServerConfig {
                bind_addr: "127.0.0.1:0".into(),
                api_key: String::new(),
                rate_limit_per_min: 120,
            }),
            rate_limiter: Arc::new(RateLimiter::new()),
        }
    }

    async fn send(router: Router, method: &str, uri: &str, body: serde_json::Value) -> Response {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        router
            .into_make_service_with_connect_info::<SocketAddr>()
            .into_service()
            .oneshot(req)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_unauthenticated_and_ok() {
        let state = test_state().await;
        let router = build_router(state);
        let resp = send(router, "GET", "/v1/health", serde_json::json!({})).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn enqueue_then_list_round_trips() {
        let state = test_state().await;
        let router = build_router(state);

        let resp = send(
            router.clone(),
            "POST",
            "/v1/tasks/enqueue",
            serde_json::json!({"action": "noop", "task_id": "t1"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send(router, "GET", "/v1/tasks", serde_json::json!({})).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_route_requires_api_key_when_configured() {
        let mut state = test_state().await;
        state.config = Arc::new(ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            api_key: "secret".into(),
            rate_limit_per_min: 120,
        });
        let router = build_router(state);

        let resp = send(
            router,
            "POST",
            "/v1/tasks/enqueue",
            serde_json::json!({"action": "noop"}),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
