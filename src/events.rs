//! Event bus & log buffer: a bounded circular log plus a fan-out to
//! WebSocket subscribers (and optionally an MQTT log topic). Subscribers
//! that fail to accept a frame are dropped rather than blocking the
//! publisher.

use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::broadcast;

pub const LOG_CAPACITY: usize = 50;
pub const LOG_MESSAGE_CAP: usize = 127;
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    Log { ts: u64, msg: String },
    NodeState { mac: String, state: serde_json::Value },
    RouteChanged { route: String },
    OtaProgress(serde_json::Value),
    OtaComplete(serde_json::Value),
    CommissionResult(serde_json::Value),
    ScanResults(serde_json::Value),
}

#[derive(Debug, Clone)]
struct LogEntry {
    ts: u64,
    msg: String,
}

/// Owns the bounded log ring and the broadcast channel WebSocket/MQTT
/// fan-out subscribes to. A short-lived lock is taken only for the
/// duration of `log`/`publish`; subscribers receive their own cloned
/// receiver and never block the publisher.
pub struct EventBus {
    log: VecDeque<LogEntry>,
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        EventBus {
            log: VecDeque::with_capacity(LOG_CAPACITY),
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    /// Writes one log entry (truncated to the message cap) and fans out
    /// the structured event. Dropped receivers (no active subscribers)
    /// are not an error.
    pub fn log(&mut self, ts: u64, msg: impl Into<String>) {
        let mut msg = msg.into();
        if msg.len() > LOG_MESSAGE_CAP {
            msg.truncate(LOG_MESSAGE_CAP);
        }
        if self.log.len() >= LOG_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(LogEntry { ts, msg: msg.clone() });
        let _ = self.sender.send(GatewayEvent::Log { ts, msg });
    }

    pub fn publish(&self, event: GatewayEvent) {
        let _ = self.sender.send(event);
    }

    pub fn recent_logs(&self) -> Vec<(u64, String)> {
        self.log.iter().map(|e| (e.ts, e.msg.clone())).collect()
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

    #[test]
    fn log_buffer_is_bounded_to_capacity() {
        let mut bus = EventBus::new();
        for i in 0..(LOG_CAPACITY + 10) {
            bus.log(i as u64, format!("entry {i}"));
        }
        assert_eq!(bus.recent_logs().len(), LOG_CAPACITY);
        // Oldest entries are evicted first.
        assert_eq!(bus.recent_logs()[0].1, "entry 10");
    }

    #[test]
    fn log_message_is_truncated_to_cap() {
        let mut bus = EventBus::new();
        let long_msg = "x".repeat(500);
        bus.log(0, long_msg);
        assert_eq!(bus.recent_logs()[0].1.len(), LOG_MESSAGE_CAP);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let mut bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.log(1, "hello");
        let event = rx.recv().await.unwrap();
        match event {
            GatewayEvent::Log { msg, .. } => assert_eq!(msg, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publishing_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(GatewayEvent::RouteChanged {
            route: "ethernet".to_string(),
        });
    }
}
