use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tokio::fs;

use outrider_types::{OrchestrationConfig, OrchestrationOverrides};

/// Process-level subagent settings, read from the `agents.defaults.subagents`
/// object of the config file. Everything is optional; absent keys fall back
/// to the hard-coded defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentSettings {
    /// Minutes until an inactive run is archived by the sweeper. Zero or
    /// negative disables archival entirely.
    pub archive_after_minutes: i64,
    pub orchestration: OrchestrationOverrides,
}

impl Default for SubagentSettings {
    fn default() -> Self {
        Self {
            archive_after_minutes: 60,
            orchestration: OrchestrationOverrides::default(),
        }
    }
}

impl SubagentSettings {
    pub fn from_config_value(root: &Value) -> Self {
        root.pointer("/agents/defaults/subagents")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    /// Read settings from a config file; a missing or malformed file yields
    /// the defaults rather than an error.
    pub async fn load(path: &Path) -> Self {
        let Ok(raw) = fs::read_to_string(path).await else {
            return Self::default();
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(root) => Self::from_config_value(&root),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "config file unreadable, using defaults");
                Self::default()
            }
        }
    }

    pub fn archive_after_ms(&self) -> Option<u64> {
        if self.archive_after_minutes <= 0 {
            return None;
        }
        Some(self.archive_after_minutes as u64 * 60_000)
    }

    /// Compose the effective orchestration policy for one registration:
    /// hard-coded defaults, then the process layer, then the per-call
    /// override, highest precedence last.
    pub fn resolve_orchestration(
        &self,
        call_override: Option<&OrchestrationOverrides>,
    ) -> OrchestrationConfig {
        let mut config = OrchestrationConfig::default();
        self.orchestration.apply_to(&mut config);
        if let Some(overrides) = call_override {
            overrides.apply_to(&mut config);
        }
        config
    }
}

pub fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Ok(dir) = std::env::var("OUTRIDER_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("outrider").join("data");
    }
    dirs::home_dir()
        .map(|home| home.join(".outrider").join("data"))
        .unwrap_or_else(|| PathBuf::from(".outrider"))
}
