use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

/// RPC surface of the agent gateway. The engine only ever issues four
/// methods (`agent.start`, `agent.query`, `agent.wait`, `sessions.delete`)
/// and treats the gateway as a black box behind this trait.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> anyhow::Result<Value>;
}

pub const SESSIONS_DELETE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaitReply {
    pub status: String,
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,
    pub error: Option<String>,
}

pub async fn agent_start(
    gateway: &dyn Gateway,
    key: &str,
    prompt: &str,
    run_id: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    gateway
        .call(
            "agent.start",
            json!({ "key": key, "prompt": prompt, "runId": run_id }),
            timeout,
        )
        .await?;
    Ok(())
}

pub async fn agent_query(
    gateway: &dyn Gateway,
    key: &str,
    prompt: &str,
    timeout: Duration,
) -> anyhow::Result<Option<String>> {
    let result = gateway
        .call(
            "agent.query",
            json!({ "key": key, "prompt": prompt }),
            timeout,
        )
        .await?;
    Ok(result
        .get("reply")
        .and_then(|v| v.as_str())
        .map(str::to_string))
}

/// Block until the gateway reports the run as finished, or until its own
/// timeout elapses. The RPC deadline is padded by 10s over the gateway-side
/// timeout so a slow reply still lands instead of being cut off mid-flight.
pub async fn agent_wait(
    gateway: &dyn Gateway,
    run_id: &str,
    timeout_ms: u64,
) -> anyhow::Result<WaitReply> {
    let deadline = Duration::from_millis(timeout_ms.saturating_add(10_000));
    let result = gateway
        .call(
            "agent.wait",
            json!({ "runId": run_id, "timeoutMs": timeout_ms }),
            deadline,
        )
        .await?;
    Ok(serde_json::from_value(result).unwrap_or_default())
}

pub async fn sessions_delete(gateway: &dyn Gateway, key: &str) -> anyhow::Result<()> {
    gateway
        .call(
            "sessions.delete",
            json!({ "key": key, "deleteTranscript": true }),
            SESSIONS_DELETE_TIMEOUT,
        )
        .await?;
    Ok(())
}

/// JSON-over-HTTP gateway client used by processes that talk to a remote
/// gateway endpoint (the admin binary, external hosts). Posts
/// `{method, params}` to `<base>/rpc` and unwraps `{result}` / `{error}`.
#[derive(Clone)]
pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn call(&self, method: &str, params: Value, timeout: Duration) -> anyhow::Result<Value> {
        let url = format!("{}/rpc", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&json!({ "method": method, "params": params }))
            .send()
            .await
            .with_context(|| format!("gateway call `{method}` failed"))?;
        let status = resp.status();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        if !status.is_success() {
            anyhow::bail!("gateway call `{method}` returned {status}");
        }
        if let Some(err) = body.get("error").and_then(|v| v.as_str()) {
            anyhow::bail!("gateway error for `{method}`: {err}");
        }
        Ok(body.get("result").cloned().unwrap_or(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoGateway {
        calls: Mutex<Vec<(String, Value)>>,
        reply: Value,
    }

    #[async_trait]
    impl Gateway for EchoGateway {
        async fn call(
            &self,
            method: &str,
            params: Value,
            _timeout: Duration,
        ) -> anyhow::Result<Value> {
            self.calls
                .lock()
                .expect("lock")
                .push((method.to_string(), params));
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn agent_query_extracts_reply_field() {
        let gateway = EchoGateway {
            calls: Mutex::new(Vec::new()),
            reply: json!({ "reply": "yes, all done" }),
        };
        let reply = agent_query(&gateway, "child-1", "done?", Duration::from_secs(5))
            .await
            .expect("query");
        assert_eq!(reply.as_deref(), Some("yes, all done"));

        let calls = gateway.calls.lock().expect("lock");
        assert_eq!(calls[0].0, "agent.query");
        assert_eq!(calls[0].1["key"], "child-1");
    }

    #[tokio::test]
    async fn agent_wait_tolerates_unknown_reply_shape() {
        let gateway = EchoGateway {
            calls: Mutex::new(Vec::new()),
            reply: json!({ "status": "ok", "endedAt": 42, "extra": true }),
        };
        let reply = agent_wait(&gateway, "run-1", 1_000).await.expect("wait");
        assert_eq!(reply.status, "ok");
        assert_eq!(reply.ended_at, Some(42));

        let calls = gateway.calls.lock().expect("lock");
        assert_eq!(calls[0].1["timeoutMs"], 1_000);
    }
}
