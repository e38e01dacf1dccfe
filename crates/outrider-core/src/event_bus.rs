use tokio::sync::broadcast;

use outrider_types::AgentEvent;

#[derive(Clone)]
pub struct AgentEventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl AgentEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for AgentEventBus {
    fn default() -> Self {
        Self::new()
    }
}
