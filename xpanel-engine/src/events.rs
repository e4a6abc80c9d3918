use serde::Serialize;
use tokio::sync::broadcast;

/// Structured progress/status record published by the listener manager.
#[derive(Debug, Clone, Serialize)]
pub struct XrayEvent {
    #[serde(rename = "type")]
    pub event_type: XrayEventType,
    pub status: EventStatus,
    /// Completion percentage in `[0, 100]`; meaningful for downloads.
    pub percent: u8,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum XrayEventType {
    Download,
    Switch,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Start,
    Progress,
    Completed,
    Error,
    Reverted,
}

impl XrayEvent {
    pub fn new(
        event_type: XrayEventType,
        status: EventStatus,
        percent: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            status,
            percent: percent.min(100),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub const EVENT_BUS_CAPACITY: usize = 64;

/// In-process event bus. Bounded: a subscriber that stops draining loses the
/// oldest events rather than blocking the publisher.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<XrayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<XrayEvent> {
        self.tx.subscribe()
    }

    /// Non-blocking publish. No subscribers is not an error.
    pub fn publish(&self, event: XrayEvent) {
        tracing::debug!(
            kind = ?event.event_type,
            status = ?event.status,
            percent = event.percent,
            message = %event.message,
            "engine event"
        );
        if self.tx.send(event).is_err() {
            tracing::trace!("engine event had no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(XrayEvent::new(XrayEventType::Download, EventStatus::Start, 0, "begin"));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.status, EventStatus::Start);
        assert_eq!(ev.percent, 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(XrayEvent::new(XrayEventType::State, EventStatus::Completed, 100, "up"));
    }

    #[test]
    fn percent_is_clamped() {
        let ev = XrayEvent::new(XrayEventType::Download, EventStatus::Progress, 250, "x");
        assert_eq!(ev.percent, 100);
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let ev = XrayEvent::new(XrayEventType::Download, EventStatus::Reverted, 0, "rollback")
            .with_details(serde_json::json!({"from": "v1.8.0"}));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "download");
        assert_eq!(json["status"], "reverted");
        assert_eq!(json["details"]["from"], "v1.8.0");
    }
}
