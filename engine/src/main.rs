use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use outrider_core::{resolve_state_dir, sessions_delete, HttpGateway, RunStore};
use outrider_observability::{canonical_logs_dir_from_root, init_process_logging, ProcessKind};
use outrider_types::RunRecord;

const ENGINE_CLI_EXAMPLES: &str = r#"Examples:
  outrider-engine runs
  outrider-engine show run-42 --state-dir .outrider-test
  outrider-engine prune --dry-run
  outrider-engine prune --gateway-url http://127.0.0.1:39710
  outrider-engine paths
"#;

const PRUNE_EXAMPLES: &str = r#"Examples:
  outrider-engine prune --dry-run
  outrider-engine prune --gateway-url http://127.0.0.1:39710
"#;

#[derive(Parser, Debug)]
#[command(name = "outrider-engine")]
#[command(version)]
#[command(about = "Admin surface for the outrider subagent orchestration engine")]
#[command(after_help = ENGINE_CLI_EXAMPLES)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "List persisted subagent runs.")]
    Runs {
        #[arg(
            long,
            env = "OUTRIDER_STATE_DIR",
            help = "Engine state directory. If omitted, uses the shared outrider path."
        )]
        state_dir: Option<String>,
    },
    #[command(about = "Print one persisted run record as JSON.")]
    Show {
        #[arg(help = "Run id to show.")]
        run_id: String,
        #[arg(long, env = "OUTRIDER_STATE_DIR", help = "Engine state directory.")]
        state_dir: Option<String>,
    },
    #[command(about = "Archive runs whose archive deadline has passed.")]
    #[command(after_help = PRUNE_EXAMPLES)]
    Prune {
        #[arg(long, env = "OUTRIDER_STATE_DIR", help = "Engine state directory.")]
        state_dir: Option<String>,
        #[arg(
            long,
            help = "Gateway base URL; when set, a best-effort sessions.delete is issued for each archived run."
        )]
        gateway_url: Option<String>,
        #[arg(long, default_value_t = false, help = "Report without changing anything.")]
        dry_run: bool,
    },
    #[command(about = "Print the resolved state paths.")]
    Paths {
        #[arg(long, env = "OUTRIDER_STATE_DIR", help = "Engine state directory.")]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Runs { state_dir } => {
            let state_dir = resolve_state_dir(state_dir.map(PathBuf::from));
            let store = RunStore::new(&state_dir);
            let mut runs: Vec<RunRecord> = store.load().await.into_values().collect();
            runs.sort_by_key(|record| record.created_at);
            if runs.is_empty() {
                println!("no persisted runs in {}", store.path().display());
                return Ok(());
            }
            for record in runs {
                println!(
                    "{:<28} {:<10} retries={} requester={}",
                    record.run_id,
                    run_status(&record),
                    record.retry_count,
                    record.requester_display_key
                );
            }
        }
        Command::Show { run_id, state_dir } => {
            let state_dir = resolve_state_dir(state_dir.map(PathBuf::from));
            let runs = RunStore::new(&state_dir).load().await;
            match runs.get(&run_id) {
                Some(record) => println!("{}", serde_json::to_string_pretty(record)?),
                None => anyhow::bail!("no persisted run `{run_id}`"),
            }
        }
        Command::Prune {
            state_dir,
            gateway_url,
            dry_run,
        } => {
            let state_dir = resolve_state_dir(state_dir.map(PathBuf::from));
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, _info) = init_process_logging(ProcessKind::Cli, &logs_dir, 14)?;

            let store = RunStore::new(&state_dir);
            let mut runs = store.load().await;
            let now = Utc::now().timestamp_millis().max(0) as u64;
            let expired: Vec<String> = runs
                .iter()
                .filter(|(_, record)| record.archive_at_ms.map(|at| at <= now).unwrap_or(false))
                .map(|(run_id, _)| run_id.clone())
                .collect();

            if expired.is_empty() {
                println!("nothing to prune");
                return Ok(());
            }
            if dry_run {
                for run_id in &expired {
                    println!("would archive {run_id}");
                }
                return Ok(());
            }

            let mut archived = Vec::new();
            for run_id in &expired {
                if let Some(record) = runs.remove(run_id) {
                    archived.push(record);
                }
            }
            store.persist(&runs).await;

            if let Some(url) = gateway_url {
                let gateway = HttpGateway::new(url);
                for record in &archived {
                    if let Err(err) = sessions_delete(&gateway, &record.child_session_key).await {
                        tracing::warn!(
                            run_id = %record.run_id,
                            error = %err,
                            "session delete failed during prune"
                        );
                    }
                }
            }
            info!(count = archived.len(), "pruned expired runs");
            println!("archived {} run(s)", archived.len());
        }
        Command::Paths { state_dir } => {
            let state_dir = resolve_state_dir(state_dir.map(PathBuf::from));
            let store = RunStore::new(&state_dir);
            println!("state dir: {}", state_dir.display());
            println!("runs file: {}", store.path().display());
            println!(
                "logs dir:  {}",
                canonical_logs_dir_from_root(&state_dir).display()
            );
        }
    }

    Ok(())
}

fn run_status(record: &RunRecord) -> &'static str {
    if record.cleanup_completed_at.is_some() {
        "done"
    } else if record.ended_at.is_some() {
        match record.outcome {
            Some(ref outcome) if !outcome.is_ok() => "failed",
            _ => "ended",
        }
    } else if record.started_at.is_some() {
        "running"
    } else {
        "pending"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outrider_types::{OrchestrationConfig, RunOutcome};
    use serde_json::Map;

    fn record() -> RunRecord {
        RunRecord {
            run_id: "run-1".into(),
            child_session_key: "child-1".into(),
            requester_session_key: "parent".into(),
            requester_origin: Default::default(),
            requester_display_key: "parent".into(),
            task: "t".into(),
            label: None,
            cleanup: Default::default(),
            created_at: 0,
            started_at: None,
            ended_at: None,
            outcome: None,
            archive_at_ms: None,
            cleanup_handled: false,
            cleanup_completed_at: None,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: None,
            is_retry: false,
            verification_attempted: false,
            verification_result: None,
            orchestration_config: OrchestrationConfig::default(),
            extra: Map::new(),
        }
    }

    #[test]
    fn status_reflects_record_progress() {
        let mut rec = record();
        assert_eq!(run_status(&rec), "pending");
        rec.started_at = Some(1);
        assert_eq!(run_status(&rec), "running");
        rec.ended_at = Some(2);
        rec.outcome = Some(RunOutcome::error("x"));
        assert_eq!(run_status(&rec), "failed");
        rec.outcome = Some(RunOutcome::Ok);
        assert_eq!(run_status(&rec), "ended");
        rec.cleanup_completed_at = Some(3);
        assert_eq!(run_status(&rec), "done");
    }
}
