use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecyclePayload {
    pub phase: LifecyclePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One event on the agent-event bus. Only `stream == "lifecycle"` events are
/// interpreted by the orchestration engine; other streams pass through
/// untouched for other subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub stream: String,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub data: LifecyclePayload,
}

pub const LIFECYCLE_STREAM: &str = "lifecycle";

impl AgentEvent {
    pub fn lifecycle(run_id: impl Into<String>, data: LifecyclePayload) -> Self {
        Self {
            stream: LIFECYCLE_STREAM.to_string(),
            run_id: run_id.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    Ok,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RunOutcome {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RunOutcome::Ok)
    }

    pub fn error_text(&self) -> Option<&str> {
        match self {
            RunOutcome::Ok => None,
            RunOutcome::Error { error } => error.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    Delete,
    #[default]
    Keep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationVerdict {
    Passed,
    Failed,
    Skipped,
}

/// Normalised transport/context tag describing where the requester session
/// lives, carried through to the announce payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOrigin {
    #[serde(default)]
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// Retry/verification policy snapshot. Composed once at registration and
/// authoritative for the whole lifetime of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestrationConfig {
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub verify_completion: bool,
    pub verification_prompt: String,
    pub verification_timeout_seconds: u64,
    pub retry_on_verification_failure: bool,
    pub verification_hook: String,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            retry_on_failure: false,
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            verify_completion: false,
            verification_prompt: String::new(),
            verification_timeout_seconds: 30,
            retry_on_verification_failure: true,
            verification_hook: String::new(),
        }
    }
}

/// Partial orchestration policy used for the process-config layer and the
/// per-registration override. `apply_to` only touches fields that are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestrationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_on_failure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_completion: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_on_verification_failure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_hook: Option<String>,
}

impl OrchestrationOverrides {
    pub fn apply_to(&self, cfg: &mut OrchestrationConfig) {
        if let Some(v) = self.retry_on_failure {
            cfg.retry_on_failure = v;
        }
        if let Some(v) = self.max_retries {
            cfg.max_retries = v;
        }
        if let Some(v) = self.backoff_multiplier {
            cfg.backoff_multiplier = v;
        }
        if let Some(v) = self.initial_delay_ms {
            cfg.initial_delay_ms = v;
        }
        if let Some(v) = self.max_delay_ms {
            cfg.max_delay_ms = v;
        }
        if let Some(v) = self.verify_completion {
            cfg.verify_completion = v;
        }
        if let Some(v) = self.verification_prompt.as_ref() {
            cfg.verification_prompt = v.clone();
        }
        if let Some(v) = self.verification_timeout_seconds {
            cfg.verification_timeout_seconds = v;
        }
        if let Some(v) = self.retry_on_verification_failure {
            cfg.retry_on_verification_failure = v;
        }
        if let Some(v) = self.verification_hook.as_ref() {
            cfg.verification_hook = v.clone();
        }
    }
}

/// Persistent orchestration state for one child-agent run. All timestamps
/// are epoch milliseconds. Unknown fields survive a load/persist round-trip
/// through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    #[serde(rename = "runId", default)]
    pub run_id: String,
    #[serde(default)]
    pub child_session_key: String,
    #[serde(default)]
    pub requester_session_key: String,
    #[serde(default)]
    pub requester_origin: DeliveryOrigin,
    #[serde(default)]
    pub requester_display_key: String,
    #[serde(default)]
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_at_ms: Option<u64>,
    #[serde(default)]
    pub cleanup_handled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_completed_at: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<u64>,
    #[serde(default)]
    pub is_retry: bool,
    #[serde(default)]
    pub verification_attempted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_result: Option<VerificationVerdict>,
    #[serde(default)]
    pub orchestration_config: OrchestrationConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunRecord {
    /// Terminal means cleanup has finished; such a record ignores every
    /// further lifecycle signal.
    pub fn is_cleanup_complete(&self) -> bool {
        self.cleanup_completed_at.is_some()
    }
}

/// The announce payload delivered back to the requester session once a run
/// reaches cleanup. Carries keys and values only, never object references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_origin: DeliveryOrigin,
    pub requester_display_key: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_result: Option<VerificationVerdict>,
}

impl RunSummary {
    pub fn from_record(record: &RunRecord) -> Self {
        Self {
            run_id: record.run_id.clone(),
            child_session_key: record.child_session_key.clone(),
            requester_session_key: record.requester_session_key.clone(),
            requester_origin: record.requester_origin.clone(),
            requester_display_key: record.requester_display_key.clone(),
            task: record.task.clone(),
            label: record.label.clone(),
            created_at: record.created_at,
            started_at: record.started_at,
            ended_at: record.ended_at,
            outcome: record.outcome.clone(),
            retry_count: record.retry_count,
            verification_result: record.verification_result,
        }
    }
}
