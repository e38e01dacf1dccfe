use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use outrider_types::{AgentEvent, LifecyclePhase, RunOutcome, LIFECYCLE_STREAM};

use crate::gateway::agent_wait;
use crate::registry::SubagentRegistry;

/// Gateway-side wait window for the cross-process prober. Kept as a module
/// constant rather than a config key; the RPC deadline adds 10s on top.
pub(crate) const WAIT_TIMEOUT_MS: u64 = 600_000;

/// Subscribe the registry to the agent-event bus. One listener per registry,
/// attached at construction, torn down through the shutdown token.
pub(crate) fn spawn_bus_listener(registry: &SubagentRegistry) {
    let mut rx = registry.inner.bus.subscribe();
    let registry = registry.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = registry.inner.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => handle_agent_event(&registry, event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "lifecycle listener lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}

pub(crate) async fn handle_agent_event(registry: &SubagentRegistry, event: AgentEvent) {
    if event.stream != LIFECYCLE_STREAM {
        return;
    }
    // Unknown run ids are someone else's events.
    if registry.get(&event.run_id).await.is_none() {
        return;
    }
    match event.data.phase {
        LifecyclePhase::Start => {
            if let Some(started_at) = event.data.started_at {
                registry.apply_start(&event.run_id, started_at).await;
            }
        }
        LifecyclePhase::End => {
            registry
                .apply_terminal(
                    &event.run_id,
                    RunOutcome::Ok,
                    event.data.started_at,
                    event.data.ended_at,
                )
                .await;
        }
        LifecyclePhase::Error => {
            registry
                .apply_terminal(
                    &event.run_id,
                    RunOutcome::Error {
                        error: event.data.error,
                    },
                    event.data.started_at,
                    event.data.ended_at,
                )
                .await;
        }
    }
}

/// Launch one `agent.wait` probe for the run. Covers processes that never
/// see in-process lifecycle events; the terminal transition is the same one
/// the listener applies, so the cleanup guard keeps the two paths honest.
pub(crate) fn arm_wait_prober(registry: &SubagentRegistry, run_id: String) {
    let registry = registry.clone();
    tokio::spawn(async move {
        let reply = tokio::select! {
            _ = registry.inner.shutdown.cancelled() => return,
            reply = agent_wait(registry.inner.gateway.as_ref(), &run_id, WAIT_TIMEOUT_MS) => reply,
        };
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                debug!(run_id, error = %err, "wait probe failed");
                return;
            }
        };
        match reply.status.as_str() {
            "ok" => {
                registry
                    .apply_terminal(&run_id, RunOutcome::Ok, reply.started_at, reply.ended_at)
                    .await;
            }
            "error" => {
                registry
                    .apply_terminal(
                        &run_id,
                        RunOutcome::Error { error: reply.error },
                        reply.started_at,
                        reply.ended_at,
                    )
                    .await;
            }
            other => {
                debug!(run_id, status = other, "wait probe returned without a terminal status");
            }
        }
    });
}
