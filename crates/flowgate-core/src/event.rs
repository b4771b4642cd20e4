use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// Events emitted by the planner and executor.
///
/// Denial events carry no policy names; observers see that a flow stopped,
/// not why.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    PlanBuilt {
        flow: String,
        stages: usize,
    },
    PlanCacheHit {
        flow: String,
        key: String,
    },
    PlanInvalidated {
        flow: String,
        entries: usize,
    },
    StagePresented {
        session: SessionId,
        stage: String,
    },
    StageCompleted {
        session: SessionId,
        stage: String,
    },
    StageInvalid {
        session: SessionId,
        stage: String,
        attempts: u32,
    },
    FlowCompleted {
        session: SessionId,
        flow: String,
    },
    FlowDenied {
        session: Option<SessionId>,
        flow: String,
    },
    FlowFailed {
        session: SessionId,
        flow: String,
    },
    FlowAborted {
        session: SessionId,
        flow: String,
    },
    FlowExpired {
        session: SessionId,
        flow: String,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
