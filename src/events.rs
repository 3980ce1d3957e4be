use axum::response::sse::Event;
use serde_json::json;
use tokio::sync::broadcast;

/// Progress events pushed to `/events` subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    /// A model call is about to be made.
    Thinking { turn: usize },
    Step { number: usize, description: String },
    StepError { action: String, message: String },
    TaskComplete { summary: String },
    GoalUpdated { goal: String },
    Stopped,
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::Step { .. } => "step",
            AgentEvent::StepError { .. } => "step_error",
            AgentEvent::TaskComplete { .. } => "task_complete",
            AgentEvent::GoalUpdated { .. } => "goal_updated",
            AgentEvent::Stopped => "stopped",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            AgentEvent::Thinking { turn } => json!({"turn": turn}),
            AgentEvent::Step {
                number,
                description,
            } => json!({"number": number, "description": description}),
            AgentEvent::StepError { action, message } => {
                json!({"action": action, "message": message})
            }
            AgentEvent::TaskComplete { summary } => json!({"summary": summary}),
            AgentEvent::GoalUpdated { goal } => json!({"goal": goal}),
            AgentEvent::Stopped => json!({}),
        }
    }

    pub fn to_sse_event(&self) -> Event {
        Event::default()
            .event(self.name())
            .data(self.payload().to_string())
    }
}

/// Fan-out of [`AgentEvent`]s. Sending never blocks and never fails.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: AgentEvent) {
        // No subscribers is the common case.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_are_json_objects() {
        let event = AgentEvent::Step {
            number: 2,
            description: "click_at \"x\"".into(),
        };
        assert_eq!(event.name(), "step");
        let parsed: serde_json::Value =
            serde_json::from_str(&event.payload().to_string()).unwrap();
        assert_eq!(parsed, json!({"number": 2, "description": "click_at \"x\""}));
        assert_eq!(AgentEvent::Stopped.payload().to_string(), "{}");
    }

    #[test]
    fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        bus.emit(AgentEvent::Stopped);
        let mut rx = bus.subscribe();
        bus.emit(AgentEvent::TaskComplete {
            summary: "Done".into(),
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            AgentEvent::TaskComplete {
                summary: "Done".into()
            }
        );
    }
}
