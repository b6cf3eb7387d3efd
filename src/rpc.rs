//! JSON-RPC (ubus over HTTP) collaborator calls.
//!
//! The device exposes its RPC bus at `{base}/ubus`. Requests carry the
//! session credential as the first positional parameter; results come
//! back as a `[code, payload]` pair.

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Path of the persisted reboot-required flag on the device.
const REBOOT_STATE_FILE: &str = "/tmp/swu_reboot_state";

pub struct UbusClient {
    http: reqwest::Client,
    url: String,
    session_id: String,
    next_id: AtomicU64,
}

impl UbusClient {
    pub fn new(http: reqwest::Client, base_url: &str, session_id: impl Into<String>) -> Self {
        Self {
            http,
            url: format!("{}/ubus", base_url.trim_end_matches('/')),
            session_id: session_id.into(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, object: &str, method: &str, args: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "call",
            "params": [self.session_id, object, method, args],
        });

        debug!("ubus call {object}.{method}");

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context("RPC request failed")?
            .error_for_status()
            .context("RPC request rejected")?;

        let body: Value = response.json().await.context("RPC response is not JSON")?;
        unwrap_result(&body)
    }

    /// Probe whether the session may perform `function` on `object`
    /// within `scope`. Any failure means "no access".
    pub async fn session_access(&self, scope: &str, object: &str, function: &str) -> bool {
        let args = json!({
            "scope": scope,
            "object": object,
            "function": function,
        });

        match self.call("session", "access", args).await {
            Ok(payload) => payload
                .get("access")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Err(e) => {
                warn!("session access probe failed: {e:#}");
                false
            }
        }
    }

    /// Read a text file from the device.
    pub async fn read_file(&self, path: &str) -> Result<String> {
        let payload = self.call("file", "read", json!({ "path": path })).await?;
        payload
            .get("data")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("file.read returned no data for {path}"))
    }

    /// Whether the applied update requires a reboot. A missing or
    /// unreadable state file means no reboot.
    pub async fn reboot_state(&self) -> bool {
        match self.read_file(REBOOT_STATE_FILE).await {
            Ok(data) => parse_reboot_state(&data),
            Err(e) => {
                debug!("reboot state unavailable, assuming none: {e:#}");
                false
            }
        }
    }
}

/// Unwrap a JSON-RPC response body into the call payload.
fn unwrap_result(body: &Value) -> Result<Value> {
    if let Some(error) = body.get("error") {
        return Err(anyhow!("RPC error: {error}"));
    }

    let result = body
        .get("result")
        .ok_or_else(|| anyhow!("RPC response has no result"))?;

    match result {
        // ubus replies with [status, payload]
        Value::Array(items) => {
            let code = items
                .first()
                .and_then(Value::as_u64)
                .ok_or_else(|| anyhow!("RPC result has no status code"))?;
            if code != 0 {
                return Err(anyhow!("RPC call failed with ubus status {code}"));
            }
            Ok(items.get(1).cloned().unwrap_or(Value::Null))
        }
        other => Ok(other.clone()),
    }
}

fn parse_reboot_state(data: &str) -> bool {
    data.trim().parse::<i64>().map(|v| v > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_successful_result() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": [0, {"access": true}]});
        let payload = unwrap_result(&body).unwrap();
        assert_eq!(payload.get("access").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn nonzero_ubus_status_is_an_error() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": [6]});
        assert!(unwrap_result(&body).is_err());
    }

    #[test]
    fn rpc_error_object_is_an_error() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32002, "message": "Access denied"}});
        assert!(unwrap_result(&body).is_err());
    }

    #[test]
    fn result_without_payload_is_null() {
        let body = json!({"result": [0]});
        assert_eq!(unwrap_result(&body).unwrap(), Value::Null);
    }

    #[test]
    fn reboot_state_parses_integers() {
        assert!(parse_reboot_state("1"));
        assert!(parse_reboot_state("2\n"));
        assert!(!parse_reboot_state("0"));
        assert!(!parse_reboot_state("-1"));
        assert!(!parse_reboot_state(""));
        assert!(!parse_reboot_state("not a number"));
    }
}
