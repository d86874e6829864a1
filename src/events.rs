use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

pub const TOPIC_BLOCK: &str = "dns:block:event";
pub const TOPIC_OVERRIDE: &str = "dns:override:event";
pub const TOPIC_REBIND: &str = "dns:blockrebind:event";

/// Publish-only side channel for per-query notifications.
///
/// Delivery is best-effort: implementations may drop under backpressure and
/// callers never observe failures.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: &str);
}

/// Published when a query is answered NXDOMAIN by policy.
#[derive(Debug, Serialize)]
pub struct BlockEvent<'a> {
    #[serde(rename = "ClientIP")]
    pub client_ip: &'a str,
    #[serde(rename = "Name")]
    pub name: &'a str,
}

/// Published when a synthesized override answer is returned.
#[derive(Debug, Serialize)]
pub struct OverrideEvent<'a> {
    #[serde(rename = "ClientIP")]
    pub client_ip: &'a str,
    #[serde(rename = "IP")]
    pub ip: &'a str,
    #[serde(rename = "Name")]
    pub name: &'a str,
}

/// Published when a rebinding attempt is NXDOMAINed post-resolution.
#[derive(Debug, Serialize)]
pub struct RebindEvent<'a> {
    #[serde(rename = "ClientIP")]
    pub client_ip: &'a str,
    #[serde(rename = "BlockedIP")]
    pub blocked_ip: &'a str,
    #[serde(rename = "Name")]
    pub name: &'a str,
}

/// Serialize and publish an event struct. Serialization failures are dropped,
/// matching the best-effort contract.
pub fn publish_event<T: Serialize>(bus: &dyn EventBus, topic: &str, event: &T) {
    if let Ok(payload) = serde_json::to_string(event) {
        bus.publish(topic, &payload);
    }
}

/// Default bus: events go to the structured log.
pub struct LogBus;

impl EventBus for LogBus {
    fn publish(&self, topic: &str, payload: &str) {
        debug!(topic, payload, "event published");
    }
}

/// In-memory recorder used by tests to assert on published events.
#[derive(Default)]
pub struct RecordingBus {
    events: Mutex<Vec<(String, String)>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.events.lock().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.events.lock().iter().map(|(t, _)| t.clone()).collect()
    }
}

impl EventBus for RecordingBus {
    fn publish(&self, topic: &str, payload: &str) {
        self.events
            .lock()
            .push((topic.to_string(), payload.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_bus_captures_payloads() {
        let bus = RecordingBus::new();
        publish_event(
            &bus,
            TOPIC_BLOCK,
            &BlockEvent {
                client_ip: "1.2.3.4",
                name: "ads.example.",
            },
        );

        let events = bus.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, TOPIC_BLOCK);
        assert!(events[0].1.contains("\"ClientIP\":\"1.2.3.4\""));
        assert!(events[0].1.contains("\"Name\":\"ads.example.\""));
    }
}
