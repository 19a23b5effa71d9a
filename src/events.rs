//! Server-sent event bus for `/api/v1/events`.
//!
//! Every kind of progress the daemon reports (`kb_sync_started`,
//! `kb_sync_progress`, `kb_sync_completed`, `kag_extract_progress`,
//! `kag_extract_completed`, `daemon_status`) funnels through one
//! broadcast channel; HTTP handlers format each event on the wire as
//! `event: <type>\ndata: <json>\n\n`.

use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Duration;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: impl Serialize) -> Self {
        Self {
            event_type: event_type.into(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Render in the exact SSE wire format: `event: <type>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event_type, self.data)
    }
}

/// Shared publish/subscribe bus. Clone is cheap; all clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    started_at: Instant,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            started_at: Instant::now(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event; a channel with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn uptime_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }

    pub fn daemon_status_event(&self) -> Event {
        Event::new("daemon_status", serde_json::json!({ "uptime_ms": self.uptime_ms() }))
    }

    /// Spawn the 30s heartbeat loop. Runs for the lifetime of the daemon.
    pub fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                bus.publish(bus.daemon_status_event());
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct SyncStarted<'a> {
    pub source_id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SyncProgress<'a> {
    pub source_id: &'a str,
    pub processed: u64,
    pub total: u64,
}

#[derive(Debug, Serialize)]
pub struct SyncCompleted<'a> {
    pub source_id: &'a str,
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
}

#[derive(Debug, Serialize)]
pub struct ExtractProgress {
    pub processed: u64,
    pub total: u64,
    pub eta_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ExtractCompleted {
    pub processed: u64,
    pub entities: u64,
    pub relations: u64,
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_wire_format_is_exact() {
        let event = Event::new("kb_sync_started", SyncStarted { source_id: "src1" });
        let sse = event.to_sse();
        assert!(sse.starts_with("event: kb_sync_started\ndata: "));
        assert!(sse.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Event::new("kb_sync_started", SyncStarted { source_id: "src1" }));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "kb_sync_started");
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(bus.daemon_status_event());
    }
}
