//! Thin, timeout-aware JSON client against a gateway's `/status`, `/action`,
//! and `/sessions` endpoints.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

const STATUS_TIMEOUT: Duration = Duration::from_secs(30);
const ACTION_TIMEOUT_FLOOR: Duration = Duration::from_secs(130);

/// Body posted to a gateway's `/action` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest {
    pub action: String,
    pub params: serde_json::Value,
    pub confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// HTTP client for gateway interactions.
///
/// Does not retry: retry policy is the scheduler's decision, and the
/// `idempotency_key` on `/action` lets the gateway deduplicate.
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    /// Floor used for `/action` requests via `max(configured, 130s)`;
    /// `/status` and `/sessions` always use a fixed 30s timeout.
    configured_action_timeout: Duration,
}

impl GatewayClient {
    pub fn new() -> Self {
        Self::with_action_timeout(ACTION_TIMEOUT_FLOOR)
    }

    pub fn with_action_timeout(configured_action_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            configured_action_timeout,
        }
    }

    fn base_url(host: &str) -> String {
        host.trim_end_matches('/').to_owned()
    }

    fn action_timeout(&self) -> Duration {
        self.configured_action_timeout.max(ACTION_TIMEOUT_FLOOR)
    }

    /// `GET {host}/status`. 30s timeout.
    pub async fn get_status(&self, host: &str) -> Result<serde_json::Value> {
        let url = format!("{}/status", Self::base_url(host));
        let resp = self
            .http
            .get(&url)
            .timeout(STATUS_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("failed to reach gateway status endpoint at {url}"))?;
        let resp = resp
            .error_for_status()
            .with_context(|| format!("gateway status endpoint returned an error ({url})"))?;
        resp.json::<serde_json::Value>()
            .await
            .context("gateway status response was not valid JSON")
    }

    /// `POST {host}/action`. `max(configured_timeout, 130s)` timeout.
    pub async fn execute_task(&self, host: &str, request: ActionRequest) -> Result<serde_json::Value> {
        let url = format!("{}/action", Self::base_url(host));
        let resp = self
            .http
            .post(&url)
            .timeout(self.action_timeout())
            .json(&request)
            .send()
            .await
            .with_context(|| format!("failed to reach gateway action endpoint at {url}"))?;
        let resp = resp
            .error_for_status()
            .with_context(|| format!("gateway action endpoint returned an error ({url})"))?;
        resp.json::<serde_json::Value>()
            .await
            .context("gateway action response was not valid JSON")
    }

    /// `GET {host}/sessions`. Best-effort: returns an empty list on a 404 or
    /// any transport/parse error rather than propagating, since this
    /// endpoint is used only for diagnostics. Accepts either a bare array
    /// or an object with a `sessions` key.
    pub async fn list_sessions(&self, host: &str) -> Vec<serde_json::Value> {
        let url = format!("{}/sessions", Self::base_url(host));
        let result: Result<Vec<serde_json::Value>> = async {
            let resp = self.http.get(&url).timeout(STATUS_TIMEOUT).send().await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            let resp = resp.error_for_status()?;
            let body: serde_json::Value = resp.json().await?;
            match body {
                serde_json::Value::Array(items) => Ok(items),
                serde_json::Value::Object(mut map) => match map.remove("sessions") {
                    Some(serde_json::Value::Array(items)) => Ok(items),
                    _ => Ok(Vec::new()),
                },
                _ => Ok(Vec::new()),
            }
        }
        .await;
        result.unwrap_or_default()
    }
}

impl Default for GatewayClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of classifying a gateway `/action` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Success,
    Failure(String),
}

/// Classify a gateway `/action` response per the scheduler's acceptance
/// rule: a case-insensitive `status` of `ok`/`success` with a `result`
/// object whose `returncode` is `0` or absent/null counts as success;
/// everything else is a failure, with the error string taken from the
/// response's `error` field when present.
pub fn classify_response(response: &serde_json::Value) -> Classification {
    let status = response
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    if matches!(status.as_str(), "ok" | "success") {
        let returncode = response
            .get("result")
            .and_then(|r| r.get("returncode"))
            .cloned()
            .unwrap_or(serde_json::Value::Number(0.into()));
        let is_zero_or_null = match &returncode {
            serde_json::Value::Null => true,
            serde_json::Value::Number(n) => n.as_i64() == Some(0),
            _ => false,
        };
        if is_zero_or_null {
            return Classification::Success;
        }
        return Classification::Failure(format!("Command failed with exit code {returncode}"));
    }

    if let Some(err) = response.get("error").and_then(|v| v.as_str()) {
        if !err.is_empty() {
            return Classification::Failure(err.to_owned());
        }
    }

    let status_display = if status.is_empty() { "unknown" } else { status.as_str() };
    Classification::Failure(format!("Gateway returned non-success status: {status_display}"))
}

/// Whether a gateway `/status` probe reports an attached agent.
pub fn probe_reports_connected(status_body: &serde_json::Value) -> bool {
    status_body
        .get("agent_connected")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ok_status_zero_returncode_as_success() {
        let body = serde_json::json!({"status": "ok", "result": {"returncode": 0}});
        assert_eq!(classify_response(&body), Classification::Success);
    }

    #[test]
    fn classifies_success_status_case_insensitive() {
        let body = serde_json::json!({"status": "SUCCESS"});
        assert_eq!(classify_response(&body), Classification::Success);
    }

    #[test]
    fn classifies_null_returncode_as_success() {
        let body = serde_json::json!({"status": "ok", "result": {"returncode": null}});
        assert_eq!(classify_response(&body), Classification::Success);
    }

    #[test]
    fn classifies_nonzero_returncode_as_failure() {
        let body = serde_json::json!({"status": "ok", "result": {"returncode": 7}});
        match classify_response(&body) {
            Classification::Failure(msg) => assert!(msg.contains("exit code 7")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn classifies_explicit_error_field() {
        let body = serde_json::json!({"status": "error", "error": "boom"});
        assert_eq!(classify_response(&body), Classification::Failure("boom".into()));
    }

    #[test]
    fn classifies_missing_status_as_unknown() {
        let body = serde_json::json!({});
        assert_eq!(
            classify_response(&body),
            Classification::Failure("Gateway returned non-success status: unknown".into())
        );
    }

    #[test]
    fn probe_detects_agent_connected() {
        assert!(probe_reports_connected(&serde_json::json!({"agent_connected": true})));
        assert!(!probe_reports_connected(&serde_json::json!({"agent_connected": false})));
        assert!(!probe_reports_connected(&serde_json::json!({})));
    }
}
