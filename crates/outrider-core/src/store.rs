//! Durable snapshot of the run registry: one JSON document, rewritten whole
//! on every persisting mutation via write-temp-then-rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tokio::fs;

use outrider_types::RunRecord;

pub const RUNS_SCHEMA_VERSION: u32 = 2;

#[derive(Clone)]
pub struct RunStore {
    path: PathBuf,
}

impl RunStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join("subagents").join("runs.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted registry. A missing file yields an empty map;
    /// malformed records are skipped; a version-1 document is migrated by
    /// taking its fields verbatim (unknown fields ride along in `extra`).
    pub async fn load(&self) -> HashMap<String, RunRecord> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "runs snapshot unreadable");
                return HashMap::new();
            }
        };
        let document = match serde_json::from_str::<Value>(&raw) {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "runs snapshot is not valid JSON");
                return HashMap::new();
            }
        };

        let version = document
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(1);
        if version != u64::from(RUNS_SCHEMA_VERSION) {
            tracing::info!(version, "migrating runs snapshot to current schema");
        }

        let Some(runs) = document.get("runs").and_then(Value::as_object) else {
            return HashMap::new();
        };

        let mut out = HashMap::new();
        for (run_id, value) in runs {
            match serde_json::from_value::<RunRecord>(value.clone()) {
                Ok(mut record) => {
                    if record.run_id.is_empty() {
                        record.run_id = run_id.clone();
                    }
                    out.insert(run_id.clone(), record);
                }
                Err(err) => {
                    tracing::warn!(run_id, error = %err, "skipping malformed run record");
                }
            }
        }
        out
    }

    /// Persist the full registry snapshot. Failures are swallowed with a
    /// warning; the in-memory state stays authoritative.
    pub async fn persist(&self, runs: &HashMap<String, RunRecord>) {
        if let Err(err) = self.try_persist(runs).await {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to persist runs snapshot");
        }
    }

    async fn try_persist(&self, runs: &HashMap<String, RunRecord>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let document = json!({
            "version": RUNS_SCHEMA_VERSION,
            "runs": runs,
        });
        let payload = serde_json::to_string_pretty(&document)?;
        // The previous good file survives until the rename lands.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, payload).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
