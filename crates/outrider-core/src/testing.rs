//! Shared doubles for the unit tests in this crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use outrider_types::RunSummary;

use crate::announce::AnnounceSink;
use crate::gateway::Gateway;

pub(crate) struct ScriptedGateway {
    pub(crate) calls: Mutex<Vec<(String, Value)>>,
    pub(crate) query_reply: Option<String>,
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn call(&self, method: &str, params: Value, _timeout: Duration) -> anyhow::Result<Value> {
        self.calls.lock().await.push((method.to_string(), params));
        Ok(match method {
            "agent.wait" => json!({ "status": "timeout" }),
            "agent.query" => match &self.query_reply {
                Some(reply) => json!({ "reply": reply }),
                None => json!({}),
            },
            _ => json!({}),
        })
    }
}

pub(crate) fn scripted_gateway() -> Arc<ScriptedGateway> {
    Arc::new(ScriptedGateway {
        calls: Mutex::new(Vec::new()),
        query_reply: None,
    })
}

pub(crate) struct CountingAnnouncer {
    attempts: AtomicUsize,
    fail_first: usize,
    pub(crate) delivered: Mutex<Vec<RunSummary>>,
}

impl CountingAnnouncer {
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnnounceSink for CountingAnnouncer {
    async fn deliver(&self, summary: RunSummary) -> bool {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return false;
        }
        self.delivered.lock().await.push(summary);
        true
    }
}

pub(crate) fn noop_announcer() -> Arc<CountingAnnouncer> {
    Arc::new(CountingAnnouncer {
        attempts: AtomicUsize::new(0),
        fail_first: 0,
        delivered: Mutex::new(Vec::new()),
    })
}

pub(crate) fn failing_announcer(fail_first: usize) -> Arc<CountingAnnouncer> {
    Arc::new(CountingAnnouncer {
        attempts: AtomicUsize::new(0),
        fail_first,
        delivered: Mutex::new(Vec::new()),
    })
}
