//! Database query functions for the control-plane task queue:
//! `control_tasks`, `control_task_events`, `control_task_file_ownership`.
//!
//! Every mutating operation here owns exactly one `BEGIN IMMEDIATE` /
//! `COMMIT` (or `ROLLBACK` on error) transaction, per the concurrency
//! contract: writers take the SQLite writer lock up front rather than
//! upgrading a read lock mid-transaction, so conflicting writers fail fast
//! as zero-row CAS updates instead of deadlocking.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{Executor, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::models::{
    ActiveAssignment, FileOwnership, Task, TaskEvent, TaskEventRow, TaskRow, WorkerMirror,
    WorkerRow,
};

/// Inputs accepted by [`enqueue_task`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueInput {
    pub action: String,
    pub params: serde_json::Value,
    pub task_id: Option<String>,
    pub priority: i32,
    pub dependencies: Vec<String>,
    pub required_files: Vec<String>,
    pub gateway_id: Option<String>,
}

async fn begin_immediate(pool: &SqlitePool) -> Result<PoolConnection<Sqlite>> {
    let mut conn = pool.acquire().await.context("failed to acquire connection")?;
    conn.execute("BEGIN IMMEDIATE")
        .await
        .context("failed to begin immediate transaction")?;
    Ok(conn)
}

async fn commit(mut conn: PoolConnection<Sqlite>) -> Result<()> {
    conn.execute("COMMIT").await.context("failed to commit transaction")?;
    Ok(())
}

async fn rollback(mut conn: PoolConnection<Sqlite>) {
    let _ = conn.execute("ROLLBACK").await;
}

fn dedup_nonempty(items: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for item in items {
        let v = item.trim();
        if !v.is_empty() && !out.iter().any(|x: &String| x == v) {
            out.push(v.to_owned());
        }
    }
    out
}

async fn fetch_task_row(conn: &mut PoolConnection<Sqlite>, task_id: &str) -> Result<Option<TaskRow>> {
    let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM control_tasks WHERE id = ?")
        .bind(task_id)
        .fetch_optional(&mut **conn)
        .await
        .context("failed to fetch task")?;
    Ok(row)
}

async fn append_event(
    conn: &mut PoolConnection<Sqlite>,
    task_id: &str,
    event_type: &str,
    from_status: Option<&str>,
    to_status: Option<&str>,
    worker_id: Option<&str>,
    claim_token: Option<&str>,
    message: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let truncated: String = message.chars().take(2000).collect();
    sqlx::query(
        "INSERT INTO control_task_events \
         (task_id, event_type, from_status, to_status, worker_id, claim_token, message, payload, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(event_type)
    .bind(from_status)
    .bind(to_status)
    .bind(worker_id)
    .bind(claim_token)
    .bind(truncated)
    .bind(payload.to_string())
    .bind(Utc::now())
    .execute(&mut **conn)
    .await
    .context("failed to append task event")?;
    Ok(())
}

async fn task_status_map(conn: &mut PoolConnection<Sqlite>) -> Result<HashMap<String, String>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT id, status FROM control_tasks")
        .fetch_all(&mut **conn)
        .await
        .context("failed to load task status map")?;
    Ok(rows
        .into_iter()
        .map(|(id, status)| (id, crate::models::normalize_status(&status)))
        .collect())
}

/// Depth-first cycle check over the dependency adjacency read in this
/// transaction's snapshot.
async fn graph_has_cycle(conn: &mut PoolConnection<Sqlite>) -> Result<bool> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT id, dependencies FROM control_tasks")
            .fetch_all(&mut **conn)
            .await
            .context("failed to load dependency graph")?;

    let mut graph: HashMap<String, Vec<String>> = HashMap::new();
    for (id, deps_json) in rows {
        let deps: Vec<String> = serde_json::from_str(&deps_json).unwrap_or_default();
        graph.insert(id, deps);
    }

    let mut visiting: HashSet<String> = HashSet::new();
    let mut visited: HashSet<String> = HashSet::new();

    fn dfs(
        node: &str,
        graph: &HashMap<String, Vec<String>>,
        visiting: &mut HashSet<String>,
        visited: &mut HashSet<String>,
    ) -> bool {
        if visited.contains(node) {
            return false;
        }
        if visiting.contains(node) {
            return true;
        }
        visiting.insert(node.to_owned());
        if let Some(next) = graph.get(node) {
            for nxt in next {
                if !graph.contains_key(nxt) {
                    return true;
                }
                if dfs(nxt, graph, visiting, visited) {
                    return true;
                }
            }
        }
        visiting.remove(node);
        visited.insert(node.to_owned());
        false
    }

    for node in graph.keys().cloned().collect::<Vec<_>>() {
        if dfs(&node, &graph, &mut visiting, &mut visited) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Enqueue a new task. Rejects duplicate ids, self-dependencies, missing
/// dependencies, and anything that would introduce a dependency cycle.
pub async fn enqueue_task(pool: &SqlitePool, input: EnqueueInput) -> Result<Task> {
    let task_id = input
        .task_id
        .unwrap_or_else(|| format!("task-{}", &Uuid::new_v4().simple().to_string()[..12]));
    let deps = dedup_nonempty(&input.dependencies);
    let files = dedup_nonempty(&input.required_files);

    if deps.iter().any(|d| d == &task_id) {
        anyhow::bail!("task cannot depend on itself");
    }

    let mut conn = begin_immediate(pool).await?;
    let result: Result<()> = async {
        let exists: Option<(String,)> =
            sqlx::query_as("SELECT id FROM control_tasks WHERE id = ?")
                .bind(&task_id)
                .fetch_optional(&mut *conn)
                .await
                .context("failed to check for existing task")?;
        if exists.is_some() {
            anyhow::bail!("task '{task_id}' already exists");
        }

        if !deps.is_empty() {
            let placeholders = std::iter::repeat("?")
                .take(deps.len())
                .collect::<Vec<_>>()
                .join(",");
            let query = format!("SELECT id FROM control_tasks WHERE id IN ({placeholders})");
            let mut q = sqlx::query_as::<_, (String,)>(&query);
            for d in &deps {
                q = q.bind(d);
            }
            let existing: Vec<(String,)> = q
                .fetch_all(&mut *conn)
                .await
                .context("failed to verify dependencies exist")?;
            let existing: HashSet<&str> = existing.iter().map(|(id,)| id.as_str()).collect();
            let missing: Vec<&str> = deps
                .iter()
                .map(String::as_str)
                .filter(|d| !existing.contains(d))
                .collect();
            if !missing.is_empty() {
                anyhow::bail!("dependency tasks not found: {}", missing.join(", "));
            }
        }

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO control_tasks \
             (id, action, params, status, priority, dependencies, dependents, required_files, \
              gateway_id, created_at, updated_at) \
             VALUES (?, ?, ?, 'queued', ?, ?, '[]', ?, ?, ?, ?)",
        )
        .bind(&task_id)
        .bind(&input.action)
        .bind(input.params.to_string())
        .bind(input.priority)
        .bind(serde_json::to_string(&deps)?)
        .bind(serde_json::to_string(&files)?)
        .bind(&input.gateway_id)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("failed to insert task")?;

        for dep_id in &deps {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT dependents FROM control_tasks WHERE id = ?")
                    .bind(dep_id)
                    .fetch_optional(&mut *conn)
                    .await?;
            let mut dependents: Vec<String> = row
                .and_then(|(d,)| serde_json::from_str(&d).ok())
                .unwrap_or_default();
            if !dependents.iter().any(|d| d == &task_id) {
                dependents.push(task_id.clone());
                sqlx::query("UPDATE control_tasks SET dependents = ?, updated_at = ? WHERE id = ?")
                    .bind(serde_json::to_string(&dependents)?)
                    .bind(now)
                    .bind(dep_id)
                    .execute(&mut *conn)
                    .await
                    .context("failed to update dependents")?;
            }
        }

        if graph_has_cycle(&mut conn).await? {
            anyhow::bail!("dependency graph cycle detected; task enqueue rejected");
        }

        append_event(
            &mut conn,
            &task_id,
            "enqueued",
            None,
            Some("queued"),
            None,
            None,
            "Task enqueued.",
            &serde_json::json!({
                "action": input.action,
                "priority": input.priority,
                "gateway_id": input.gateway_id,
            }),
        )
        .await?;

        Ok(())
    }
    .await;

    match result {
        Ok(()) => commit(conn).await?,
        Err(e) => {
            rollback(conn).await;
            return Err(e);
        }
    }

    get_task(pool, &task_id)
        .await?
        .context("task was enqueued but could not be loaded")
}

/// Fetch a single task by id.
pub async fn get_task(pool: &SqlitePool, task_id: &str) -> Result<Option<Task>> {
    let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM control_tasks WHERE id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;
    Ok(row.map(Task::from))
}

/// List tasks, optionally filtered by status (aliases accepted), newest first.
pub async fn list_tasks(pool: &SqlitePool, status: Option<&str>, limit: i64) -> Result<Vec<Task>> {
    let rows = if let Some(status) = status {
        let normalized = crate::models::normalize_status(status);
        sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM control_tasks WHERE status = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(normalized)
        .bind(limit)
        .fetch_all(pool)
        .await
    } else {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM control_tasks ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await
    }
    .context("failed to list tasks")?;
    Ok(rows.into_iter().map(Task::from).collect())
}

struct ReadyCandidate {
    id: String,
    status: String,
    dependencies: String,
    required_files: String,
}

async fn ready_candidates(
    conn: impl sqlx::Executor<'_, Database = Sqlite>,
) -> Result<Vec<ReadyCandidate>> {
    let rows: Vec<(String, String, String, String)> = sqlx::query_as(
        "SELECT id, status, dependencies, required_files FROM control_tasks \
         WHERE status IN ('queued', 'released') AND locked_by IS NULL \
         ORDER BY priority DESC, created_at ASC LIMIT 200",
    )
    .fetch_all(conn)
    .await
    .context("failed to load ready candidates")?;
    Ok(rows
        .into_iter()
        .map(|(id, status, dependencies, required_files)| ReadyCandidate {
            id,
            status,
            dependencies,
            required_files,
        })
        .collect())
}

async fn files_unowned(
    conn: &mut PoolConnection<Sqlite>,
    task_id: &str,
    files: &[String],
) -> Result<bool> {
    for file_path in files {
        let owner: Option<(String,)> =
            sqlx::query_as("SELECT owning_task FROM control_task_file_ownership WHERE file_path = ?")
                .bind(file_path)
                .fetch_optional(&mut **conn)
                .await?;
        if let Some((owner,)) = owner {
            if owner != task_id {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Dry-run readiness check: the first task that would be eligible to
/// claim, without locking it. Advisory -- may race with real claimers.
pub async fn peek_next_ready_task(pool: &SqlitePool) -> Result<Option<Task>> {
    let candidates = ready_candidates(pool).await?;
    let status_map = {
        let mut conn = pool.acquire().await?;
        task_status_map(&mut conn).await?
    };

    for cand in &candidates {
        let deps: Vec<String> = serde_json::from_str(&cand.dependencies).unwrap_or_default();
        if deps
            .iter()
            .any(|d| status_map.get(d).map(String::as_str) != Some("succeeded"))
        {
            continue;
        }
        let files: Vec<String> = dedup_nonempty(
            &serde_json::from_str::<Vec<String>>(&cand.required_files).unwrap_or_default(),
        );
        let mut conn = pool.acquire().await?;
        if !files_unowned(&mut conn, &cand.id, &files).await? {
            continue;
        }
        if let Some(task) = get_task(pool, &cand.id).await? {
            return Ok(Some(task));
        }
    }
    Ok(None)
}

/// Atomically claim one ready task for `worker_id`. See module docs for the
/// transaction and CAS discipline.
pub async fn claim_next_ready_task(pool: &SqlitePool, worker_id: &str) -> Result<Option<Task>> {
    let mut conn = begin_immediate(pool).await?;

    let outcome: Result<Option<String>> = async {
        let candidates = ready_candidates(&mut *conn).await?;
        let status_map = task_status_map(&mut conn).await?;

        for cand in &candidates {
            let deps: Vec<String> = serde_json::from_str(&cand.dependencies).unwrap_or_default();
            if deps
                .iter()
                .any(|d| status_map.get(d).map(String::as_str) != Some("succeeded"))
            {
                continue;
            }

            let task_id = cand.id.clone();
            let previous_status = crate::models::normalize_status(&cand.status);
            let claim_token = Uuid::new_v4().simple().to_string();
            let now = Utc::now();

            let update_result = sqlx::query(
                "UPDATE control_tasks SET status = 'claimed', locked_by = ?, locked_at = ?, \
                 claim_token = ?, updated_at = ? \
                 WHERE id = ? AND status = ? AND locked_by IS NULL",
            )
            .bind(worker_id)
            .bind(now)
            .bind(&claim_token)
            .bind(now)
            .bind(&task_id)
            .bind(&previous_status)
            .execute(&mut *conn)
            .await
            .context("failed to claim task")?;

            if update_result.rows_affected() == 0 {
                continue;
            }

            let task_row = fetch_task_row(&mut conn, &task_id).await?;
            let Some(task_row) = task_row else { continue };
            let files = dedup_nonempty(
                &serde_json::from_str::<Vec<String>>(&task_row.required_files).unwrap_or_default(),
            );

            let mut conflict = false;
            for file_path in &files {
                let insert_result = sqlx::query(
                    "INSERT OR IGNORE INTO control_task_file_ownership \
                     (file_path, owning_task, claim_token, claimed_at) VALUES (?, ?, ?, ?)",
                )
                .bind(file_path)
                .bind(&task_id)
                .bind(&claim_token)
                .bind(now)
                .execute(&mut *conn)
                .await
                .context("failed to claim file ownership")?;

                if insert_result.rows_affected() == 0 {
                    let owner: Option<(String,)> = sqlx::query_as(
                        "SELECT owning_task FROM control_task_file_ownership WHERE file_path = ?",
                    )
                    .bind(file_path)
                    .fetch_optional(&mut *conn)
                    .await?;
                    if owner.map(|(o,)| o) != Some(task_id.clone()) {
                        conflict = true;
                        break;
                    }
                }
            }

            if conflict {
                sqlx::query(
                    "DELETE FROM control_task_file_ownership WHERE owning_task = ? AND claim_token = ?",
                )
                .bind(&task_id)
                .bind(&claim_token)
                .execute(&mut *conn)
                .await?;

                sqlx::query(
                    "UPDATE control_tasks SET status = ?, locked_by = NULL, locked_at = NULL, \
                     claim_token = NULL, updated_at = ? WHERE id = ? AND claim_token = ?",
                )
                .bind(&previous_status)
                .bind(now)
                .bind(&task_id)
                .bind(&claim_token)
                .execute(&mut *conn)
                .await?;

                append_event(
                    &mut conn,
                    &task_id,
                    "claim_conflict",
                    Some("claimed"),
                    Some(&previous_status),
                    Some(worker_id),
                    Some(&claim_token),
                    "Claim reverted due to required-file ownership conflict.",
                    &serde_json::json!({}),
                )
                .await?;
                continue;
            }

            append_event(
                &mut conn,
                &task_id,
                "claimed",
                Some(&previous_status),
                Some("claimed"),
                Some(worker_id),
                Some(&claim_token),
                "Task claimed.",
                &serde_json::json!({}),
            )
            .await?;

            return Ok(Some(task_id));
        }

        Ok(None)
    }
    .await;

    match outcome {
        Ok(Some(task_id)) => {
            commit(conn).await?;
            get_task(pool, &task_id).await
        }
        Ok(None) => {
            commit(conn).await?;
            Ok(None)
        }
        Err(e) => {
            rollback(conn).await;
            Err(e)
        }
    }
}

/// Shared guard logic for mutations keyed on `(worker_id, claim_token)`.
async fn load_guarded(
    conn: &mut PoolConnection<Sqlite>,
    task_id: &str,
    worker_id: &str,
    claim_token: &str,
) -> Result<Option<String>> {
    let row: Option<(String, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT status, locked_by, claim_token FROM control_tasks WHERE id = ?",
    )
    .bind(task_id)
    .fetch_optional(&mut **conn)
    .await
    .context("failed to load task for guarded mutation")?;

    let Some((status, locked_by, token)) = row else {
        return Ok(None);
    };
    if locked_by.as_deref() != Some(worker_id) || token.as_deref() != Some(claim_token) {
        return Ok(None);
    }
    Ok(Some(crate::models::normalize_status(&status)))
}

/// Transition a claimed task to `running`.
pub async fn mark_task_running(
    pool: &SqlitePool,
    task_id: &str,
    worker_id: &str,
    claim_token: &str,
) -> Result<bool> {
    let mut conn = begin_immediate(pool).await?;
    let outcome: Result<bool> = async {
        let Some(status) = load_guarded(&mut conn, task_id, worker_id, claim_token).await? else {
            return Ok(false);
        };
        if !matches!(status.as_str(), "claimed") {
            return Ok(false);
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE control_tasks SET status = 'running', updated_at = ? WHERE id = ? AND claim_token = ?",
        )
        .bind(now)
        .bind(task_id)
        .bind(claim_token)
        .execute(&mut *conn)
        .await
        .context("failed to mark task running")?;

        append_event(
            &mut conn,
            task_id,
            "running",
            Some(&status),
            Some("running"),
            Some(worker_id),
            Some(claim_token),
            "Task execution started.",
            &serde_json::json!({}),
        )
        .await?;
        Ok(true)
    }
    .await;

    finish(conn, outcome).await
}

async fn finish(conn: PoolConnection<Sqlite>, outcome: Result<bool>) -> Result<bool> {
    match outcome {
        Ok(applied) => {
            commit(conn).await?;
            Ok(applied)
        }
        Err(e) => {
            rollback(conn).await;
            Err(e)
        }
    }
}

/// Finalize a running task as succeeded or failed.
#[allow(clippy::too_many_arguments)]
pub async fn complete_task(
    pool: &SqlitePool,
    task_id: &str,
    worker_id: &str,
    claim_token: &str,
    success: bool,
    result: &serde_json::Value,
    error: &str,
) -> Result<bool> {
    let next_status = if success { "succeeded" } else { "failed" };
    let event_type = if success { "succeeded" } else { "failed" };
    let truncated_error: String = error.chars().take(2000).collect();

    let mut conn = begin_immediate(pool).await?;
    let outcome: Result<bool> = async {
        let Some(status) = load_guarded(&mut conn, task_id, worker_id, claim_token).await? else {
            return Ok(false);
        };
        if !status_allows(&status, next_status) {
            return Ok(false);
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE control_tasks SET status = ?, result = ?, error = ?, completed_at = ?, \
             updated_at = ?, locked_by = NULL, locked_at = NULL, claim_token = NULL \
             WHERE id = ? AND claim_token = ?",
        )
        .bind(next_status)
        .bind(result.to_string())
        .bind(&truncated_error)
        .bind(now)
        .bind(now)
        .bind(task_id)
        .bind(claim_token)
        .execute(&mut *conn)
        .await
        .context("failed to complete task")?;

        sqlx::query("DELETE FROM control_task_file_ownership WHERE owning_task = ?")
            .bind(task_id)
            .execute(&mut *conn)
            .await?;

        append_event(
            &mut conn,
            task_id,
            event_type,
            Some(&status),
            Some(next_status),
            Some(worker_id),
            Some(claim_token),
            if success { "Task finished." } else { "Task failed." },
            &serde_json::json!({"success": success, "error": error}),
        )
        .await?;
        Ok(true)
    }
    .await;

    finish(conn, outcome).await
}

fn status_allows(from: &str, to: &str) -> bool {
    use crate::models::TaskStatus;
    let (Ok(from), Ok(to)) = (from.parse::<TaskStatus>(), to.parse::<TaskStatus>()) else {
        return false;
    };
    from.can_transition_to(to)
}

/// Release a claim back to `released` (re-eligible) or `failed` (terminal).
pub async fn release_claim(
    pool: &SqlitePool,
    task_id: &str,
    worker_id: &str,
    claim_token: &str,
    reason: &str,
    back_to_pending: bool,
) -> Result<bool> {
    let next_status = if back_to_pending { "released" } else { "failed" };
    let event_type = if back_to_pending { "released" } else { "failed" };
    let truncated: String = reason.chars().take(2000).collect();

    let mut conn = begin_immediate(pool).await?;
    let outcome: Result<bool> = async {
        let Some(status) = load_guarded(&mut conn, task_id, worker_id, claim_token).await? else {
            return Ok(false);
        };
        if !status_allows(&status, next_status) {
            return Ok(false);
        }

        let now = Utc::now();
        let completed_at = if matches!(next_status, "failed") {
            Some(now)
        } else {
            None
        };

        sqlx::query(
            "UPDATE control_tasks SET status = ?, error = ?, completed_at = ?, updated_at = ?, \
             locked_by = NULL, locked_at = NULL, claim_token = NULL \
             WHERE id = ? AND claim_token = ?",
        )
        .bind(next_status)
        .bind(&truncated)
        .bind(completed_at)
        .bind(now)
        .bind(task_id)
        .bind(claim_token)
        .execute(&mut *conn)
        .await
        .context("failed to release claim")?;

        sqlx::query("DELETE FROM control_task_file_ownership WHERE owning_task = ?")
            .bind(task_id)
            .execute(&mut *conn)
            .await?;

        let message = if truncated.is_empty() {
            "Task claim released.".to_owned()
        } else {
            truncated.clone()
        };
        append_event(
            &mut conn,
            task_id,
            event_type,
            Some(&status),
            Some(next_status),
            Some(worker_id),
            Some(claim_token),
            &message,
            &serde_json::json!({}),
        )
        .await?;
        Ok(true)
    }
    .await;

    finish(conn, outcome).await
}

/// Mark a stale claim as failed due to timeout. Used only by the reaper.
pub async fn mark_failed_timeout(
    pool: &SqlitePool,
    task_id: &str,
    worker_id: &str,
    claim_token: &str,
    reason: &str,
) -> Result<bool> {
    let truncated: String = reason.chars().take(2000).collect();

    let mut conn = begin_immediate(pool).await?;
    let outcome: Result<bool> = async {
        let Some(status) = load_guarded(&mut conn, task_id, worker_id, claim_token).await? else {
            return Ok(false);
        };
        if !status_allows(&status, "failed_timeout") {
            return Ok(false);
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE control_tasks SET status = 'failed_timeout', error = ?, completed_at = ?, \
             updated_at = ?, locked_by = NULL, locked_at = NULL, claim_token = NULL \
             WHERE id = ? AND claim_token = ?",
        )
        .bind(&truncated)
        .bind(now)
        .bind(now)
        .bind(task_id)
        .bind(claim_token)
        .execute(&mut *conn)
        .await
        .context("failed to mark task failed_timeout")?;

        sqlx::query("DELETE FROM control_task_file_ownership WHERE owning_task = ?")
            .bind(task_id)
            .execute(&mut *conn)
            .await?;

        append_event(
            &mut conn,
            task_id,
            "failed_timeout",
            Some(&status),
            Some("failed_timeout"),
            Some(worker_id),
            Some(claim_token),
            &truncated,
            &serde_json::json!({}),
        )
        .await?;
        Ok(true)
    }
    .await;

    finish(conn, outcome).await
}

/// Explicitly claim an additional file for an active task.
///
/// Returns `(ok, owner_task_id)`. `ok` is true if this task now owns the
/// file (whether freshly claimed or already owned by it).
pub async fn claim_file(
    pool: &SqlitePool,
    task_id: &str,
    claim_token: &str,
    file_path: &str,
) -> Result<(bool, Option<String>)> {
    let file_path = file_path.trim();
    if file_path.is_empty() {
        return Ok((false, None));
    }

    let mut conn = begin_immediate(pool).await?;
    let outcome: Result<(bool, Option<String>)> = async {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT status, claim_token FROM control_tasks WHERE id = ?")
                .bind(task_id)
                .fetch_optional(&mut *conn)
                .await?;
        let Some((status, token)) = row else {
            return Ok((false, None));
        };
        let status: crate::models::TaskStatus = crate::models::normalize_status(&status)
            .parse()
            .map_err(|e: crate::models::TaskStatusParseError| anyhow::anyhow!(e.to_string()))?;
        if !status.is_active() || token.as_deref() != Some(claim_token) {
            return Ok((false, None));
        }

        let now = Utc::now();
        let insert_result = sqlx::query(
            "INSERT OR IGNORE INTO control_task_file_ownership \
             (file_path, owning_task, claim_token, claimed_at) VALUES (?, ?, ?, ?)",
        )
        .bind(file_path)
        .bind(task_id)
        .bind(claim_token)
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("failed to insert file ownership")?;

        if insert_result.rows_affected() > 0 {
            return Ok((true, Some(task_id.to_owned())));
        }

        let owner: Option<(String,)> = sqlx::query_as(
            "SELECT owning_task FROM control_task_file_ownership WHERE file_path = ?",
        )
        .bind(file_path)
        .fetch_optional(&mut *conn)
        .await?;
        let owner = owner.map(|(o,)| o);
        let ok = owner.as_deref() == Some(task_id);
        Ok((ok, owner))
    }
    .await;

    match outcome {
        Ok(value) => {
            // Successful claim commits; a conflict (or no-op) rolls back
            // since nothing should be persisted.
            if value.0 {
                commit(conn).await?;
            } else {
                rollback(conn).await;
            }
            Ok(value)
        }
        Err(e) => {
            rollback(conn).await;
            Err(e)
        }
    }
}

/// Release every file ownership row held by a task. Returns the number of
/// rows deleted.
pub async fn release_files_for_task(pool: &SqlitePool, task_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM control_task_file_ownership WHERE owning_task = ?")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to release file ownership")?;
    Ok(result.rows_affected())
}

/// Snapshot of all active file ownership rows, ordered by path.
pub async fn list_file_ownership(pool: &SqlitePool) -> Result<Vec<FileOwnership>> {
    let rows = sqlx::query_as::<_, FileOwnership>(
        "SELECT file_path, owning_task, claim_token, claimed_at \
         FROM control_task_file_ownership ORDER BY file_path",
    )
    .fetch_all(pool)
    .await
    .context("failed to list file ownership")?;
    Ok(rows)
}

/// List task events, optionally filtered by task id and/or a minimum
/// `created_at`, ascending by id (insertion order), capped at `limit`.
pub async fn list_task_events(
    pool: &SqlitePool,
    task_id: Option<&str>,
    since: Option<DateTime<Utc>>,
    limit: i64,
) -> Result<Vec<TaskEvent>> {
    let mut sql = String::from(
        "SELECT id, task_id, event_type, from_status, to_status, worker_id, \
         claim_token, message, payload, created_at FROM control_task_events",
    );
    let mut clauses = Vec::new();
    if task_id.is_some() {
        clauses.push("task_id = ?");
    }
    if since.is_some() {
        clauses.push("created_at >= ?");
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY id DESC LIMIT ?");

    let mut query = sqlx::query_as::<_, TaskEventRow>(&sql);
    if let Some(task_id) = task_id {
        query = query.bind(task_id);
    }
    if let Some(since) = since {
        query = query.bind(since);
    }
    query = query.bind(limit);

    let mut rows = query
        .fetch_all(pool)
        .await
        .context("failed to list task events")?;
    rows.reverse();
    Ok(rows.into_iter().map(TaskEvent::from).collect())
}

/// Active (claimed/running) task assignments, joined against their
/// claiming worker. Limit 500, ordered by lock age (oldest first).
pub async fn list_active_assignments(pool: &SqlitePool, limit: i64) -> Result<Vec<ActiveAssignment>> {
    let rows = sqlx::query_as::<_, ActiveAssignment>(
        "SELECT id AS task_id, action, status, locked_by AS agent_id, locked_at, \
         gateway_id, claim_token, updated_at \
         FROM control_tasks WHERE status IN ('claimed', 'running') AND locked_by IS NOT NULL \
         ORDER BY locked_at ASC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list active assignments")?;
    Ok(rows)
}

/// Every active task whose lock has aged past `ttl_seconds`. Read-only.
pub async fn list_stale_locked_tasks(pool: &SqlitePool, ttl_seconds: i64) -> Result<Vec<Task>> {
    let rows = sqlx::query_as::<_, TaskRow>(
        "SELECT * FROM control_tasks \
         WHERE status IN ('claimed', 'running') AND locked_by IS NOT NULL AND locked_at IS NOT NULL",
    )
    .fetch_all(pool)
    .await
    .context("failed to scan for stale locks")?;

    let now = Utc::now();
    let mut stale = Vec::new();
    for row in rows {
        if let Some(locked_at) = row.locked_at {
            if locked_at + ChronoDuration::seconds(ttl_seconds) <= now {
                stale.push(Task::from(row));
            }
        }
    }
    Ok(stale)
}

/// Upsert a worker's last-known state into the best-effort `workers`
/// mirror table. Authoritative worker health lives in the in-process
/// registry; this is purely a queryable trace of registrations, so
/// callers should log-and-ignore failures rather than fail the request.
pub async fn upsert_worker_mirror(
    pool: &SqlitePool,
    id: &str,
    provider_name: &str,
    status: &str,
    capabilities: &[String],
    metadata: &serde_json::Value,
) -> Result<WorkerMirror> {
    let now = Utc::now();
    let capabilities_json = serde_json::to_string(capabilities).unwrap_or_else(|_| "[]".to_owned());
    let metadata_json = serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_owned());

    let row = sqlx::query_as::<_, WorkerRow>(
        "INSERT INTO workers (id, provider_name, status, capabilities, metadata, last_heartbeat, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
            provider_name = excluded.provider_name, \
            status = excluded.status, \
            capabilities = excluded.capabilities, \
            metadata = excluded.metadata, \
            last_heartbeat = excluded.last_heartbeat, \
            updated_at = excluded.updated_at \
         RETURNING *",
    )
    .bind(id)
    .bind(provider_name)
    .bind(status)
    .bind(&capabilities_json)
    .bind(&metadata_json)
    .bind(now)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to upsert worker mirror")?;

    Ok(WorkerMirror::from(row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, run_migrations};
    use crate::config::DbConfig;

    async fn test_pool() -> SqlitePool {
        let pool = create_pool(&DbConfig::in_memory()).await.unwrap();
        run_migrations(&pool, crate::pool::default_migrations_path())
            .await
            .unwrap();
        pool
    }

    fn input(action: &str) -> EnqueueInput {
        EnqueueInput {
            action: action.to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn enqueue_rejects_self_dependency() {
        let pool = test_pool().await;
        let mut i = input("a");
        i.task_id = Some("self".into());
        i.dependencies = vec!["self".into()];
        assert!(enqueue_task(&pool, i).await.is_err());
    }

    #[tokio::test]
    async fn enqueue_rejects_missing_dependency() {
        let pool = test_pool().await;
        let mut i = input("a");
        i.dependencies = vec!["ghost".into()];
        assert!(enqueue_task(&pool, i).await.is_err());
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_id() {
        let pool = test_pool().await;
        let mut i = input("a");
        i.task_id = Some("dup".into());
        enqueue_task(&pool, i.clone()).await.unwrap();
        assert!(enqueue_task(&pool, i).await.is_err());
    }

    #[tokio::test]
    async fn linear_dependency_scenario() {
        let pool = test_pool().await;
        let mut t1 = input("a");
        t1.task_id = Some("t1".into());
        enqueue_task(&pool, t1).await.unwrap();

        let mut t2 = input("b");
        t2.task_id = Some("t2".into());
        t2.dependencies = vec!["t1".into()];
        enqueue_task(&pool, t2).await.unwrap();

        let claimed = claim_next_ready_task(&pool, "w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, "t1");

        assert!(claim_next_ready_task(&pool, "w2").await.unwrap().is_none());

        assert!(mark_task_running(&pool, "t1", "w1", claimed.claim_token.as_deref().unwrap())
            .await
            .unwrap());
        assert!(complete_task(
            &pool,
            "t1",
            "w1",
            claimed.claim_token.as_deref().unwrap(),
            true,
            &serde_json::json!({}),
            "",
        )
        .await
        .unwrap());

        let claimed2 = claim_next_ready_task(&pool, "w2").await.unwrap().unwrap();
        assert_eq!(claimed2.id, "t2");
    }

    #[tokio::test]
    async fn file_conflict_scenario() {
        let pool = test_pool().await;
        let mut a = input("a");
        a.task_id = Some("a".into());
        a.required_files = vec!["src/app.py".into()];
        enqueue_task(&pool, a).await.unwrap();

        let mut b = input("b");
        b.task_id = Some("b".into());
        b.required_files = vec!["src/app.py".into()];
        enqueue_task(&pool, b).await.unwrap();

        let claimed_a = claim_next_ready_task(&pool, "w1").await.unwrap().unwrap();
        assert_eq!(claimed_a.id, "a");
        let token_a = claimed_a.claim_token.clone().unwrap();
        assert!(mark_task_running(&pool, "a", "w1", &token_a).await.unwrap());

        assert!(claim_next_ready_task(&pool, "w2").await.unwrap().is_none());

        assert!(complete_task(&pool, "a", "w1", &token_a, true, &serde_json::json!({}), "")
            .await
            .unwrap());

        let claimed_b = claim_next_ready_task(&pool, "w2").await.unwrap().unwrap();
        assert_eq!(claimed_b.id, "b");
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let pool = test_pool().await;
        let mut i = input("a");
        i.task_id = Some("only".into());
        enqueue_task(&pool, i).await.unwrap();

        let claimed = claim_next_ready_task(&pool, "w1").await.unwrap().unwrap();
        let token = claimed.claim_token.clone().unwrap();

        // Attempt complete without start.
        let ok = complete_task(&pool, "only", "w1", &token, true, &serde_json::json!({}), "")
            .await
            .unwrap();
        assert!(!ok);

        let task = get_task(&pool, "only").await.unwrap().unwrap();
        assert_eq!(task.status, crate::models::TaskStatus::Claimed);
        assert_eq!(task.claim_token.as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn post_terminal_release_is_rejected() {
        let pool = test_pool().await;
        let mut i = input("a");
        i.task_id = Some("only".into());
        enqueue_task(&pool, i).await.unwrap();

        let claimed = claim_next_ready_task(&pool, "w1").await.unwrap().unwrap();
        let token = claimed.claim_token.clone().unwrap();
        mark_task_running(&pool, "only", "w1", &token).await.unwrap();
        complete_task(&pool, "only", "w1", &token, true, &serde_json::json!({}), "")
            .await
            .unwrap();

        let ok = release_claim(&pool, "only", "w1", &token, "", true).await.unwrap();
        assert!(!ok);

        let task = get_task(&pool, "only").await.unwrap().unwrap();
        assert_eq!(task.status, crate::models::TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn release_then_reclaim_mints_new_token() {
        let pool = test_pool().await;
        let mut i = input("a");
        i.task_id = Some("only".into());
        enqueue_task(&pool, i).await.unwrap();

        let claimed = claim_next_ready_task(&pool, "w1").await.unwrap().unwrap();
        let token1 = claimed.claim_token.clone().unwrap();
        assert!(release_claim(&pool, "only", "w1", &token1, "retry", true)
            .await
            .unwrap());

        let reclaimed = claim_next_ready_task(&pool, "w1").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, "only");
        assert_ne!(reclaimed.claim_token, Some(token1));
    }

    #[tokio::test]
    async fn idempotent_release_second_call_is_a_noop() {
        let pool = test_pool().await;
        let mut i = input("a");
        i.task_id = Some("only".into());
        enqueue_task(&pool, i).await.unwrap();

        let claimed = claim_next_ready_task(&pool, "w1").await.unwrap().unwrap();
        let token = claimed.claim_token.clone().unwrap();
        assert!(release_claim(&pool, "only", "w1", &token, "r", true).await.unwrap());
        assert!(!release_claim(&pool, "only", "w1", &token, "r", true).await.unwrap());
    }

    #[tokio::test]
    async fn claim_returns_none_on_empty_queue() {
        let pool = test_pool().await;
        assert!(claim_next_ready_task(&pool, "w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_scan_ignores_fresh_locks() {
        let pool = test_pool().await;
        let mut i = input("a");
        i.task_id = Some("only".into());
        enqueue_task(&pool, i).await.unwrap();
        claim_next_ready_task(&pool, "w1").await.unwrap();

        let stale = list_stale_locked_tasks(&pool, 300).await.unwrap();
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn manual_file_claim_conflict_reports_owner() {
        let pool = test_pool().await;
        let mut a = input("a");
        a.task_id = Some("a".into());
        enqueue_task(&pool, a).await.unwrap();
        let mut b = input("b");
        b.task_id = Some("b".into());
        enqueue_task(&pool, b).await.unwrap();

        let claimed_a = claim_next_ready_task(&pool, "w1").await.unwrap().unwrap();
        let token_a = claimed_a.claim_token.clone().unwrap();
        let claimed_b = claim_next_ready_task(&pool, "w2").await.unwrap().unwrap();
        let token_b = claimed_b.claim_token.clone().unwrap();

        let (ok, owner) = claim_file(&pool, "a", &token_a, "shared.txt").await.unwrap();
        assert!(ok);
        assert_eq!(owner.as_deref(), Some("a"));

        let (ok2, owner2) = claim_file(&pool, "b", &token_b, "shared.txt").await.unwrap();
        assert!(!ok2);
        assert_eq!(owner2.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn worker_mirror_upsert_then_refresh() {
        let pool = test_pool().await;
        let first = upsert_worker_mirror(
            &pool,
            "worker-1",
            "openclaw",
            "online",
            &["docker".to_owned()],
            &serde_json::json!({"gateway_id": "g1"}),
        )
        .await
        .unwrap();
        assert_eq!(first.status, "online");

        let second = upsert_worker_mirror(
            &pool,
            "worker-1",
            "openclaw",
            "degraded",
            &["docker".to_owned()],
            &serde_json::json!({"gateway_id": "g1"}),
        )
        .await
        .unwrap();
        assert_eq!(second.status, "degraded");
        assert_eq!(first.created_at, second.created_at);
    }
}
