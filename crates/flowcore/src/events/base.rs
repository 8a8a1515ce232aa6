use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Observability side-channel. Calls are fire-and-forget and must never block
/// the engine.
pub trait Notifier: Send + Sync {
    fn on_state_change(&self, entity_id: &str, new_status: &str);

    fn on_execution_duration(&self, seconds: f64);
}

/// Events emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    StateChanged {
        entity_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },
    ExecutionDuration {
        seconds: f64,
        timestamp: DateTime<Utc>,
    },
}

/// Entity id used for step-level notifications.
pub fn step_entity_id(instance_id: impl std::fmt::Display, step_id: &str) -> String {
    format!("{}/{}", instance_id, step_id)
}

/// Global event bus
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl Notifier for EventBus {
    fn on_state_change(&self, entity_id: &str, new_status: &str) {
        self.emit(ExecutionEvent::StateChanged {
            entity_id: entity_id.to_string(),
            status: new_status.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn on_execution_duration(&self, seconds: f64) {
        self.emit(ExecutionEvent::ExecutionDuration {
            seconds,
            timestamp: Utc::now(),
        });
    }
}
