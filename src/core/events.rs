//! Push events fanned out to connected clients.
//!
//! Delivery is best-effort: a subscriber that falls behind skips the events it
//! missed, and nothing is replayed to late subscribers. Clients reconcile by
//! re-reading the registry and ledger after (re)connecting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use super::models::Device;

/// Buffered events per subscriber before it starts lagging.
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    DeviceUpdate(DeviceUpdate),
    ProgressUpdate(ProgressUpdate),
    LedgerUpdate(LedgerUpdate),
    Notification(Notification),
    SystemStatus(SystemStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub device_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeviceUpdate {
    pub fn from_device(device: &Device) -> Self {
        Self {
            device_id: device.id.clone(),
            status: device.status.label().to_string(),
            progress: device.status.progress(),
            error_message: device.status.error_message().map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub device_id: String,
    pub device_progress: u8,
    pub job_progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerUpdate {
    pub action: String,
    pub certificate_id: String,
    pub device_id: String,
    pub chain_index: u64,
    pub digest: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub level: NotificationLevel,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            level,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub connected_clients: usize,
    pub active_jobs: usize,
    pub devices: usize,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Wire name of the variant, as used in WebSocket frames.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeviceUpdate(_) => "device_update",
            Self::ProgressUpdate(_) => "progress_update",
            Self::LedgerUpdate(_) => "ledger_update",
            Self::Notification(_) => "notification",
            Self::SystemStatus(_) => "system_status",
        }
    }
}

/// Broadcast bus shared by every publisher in the daemon.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Publish to current subscribers. Returns how many received it.
    pub fn publish(&self, event: Event) -> usize {
        let name = event.name();
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(event = name, delivered, "Event published");
        delivered
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }
}

/// One subscriber's view of the bus.
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Next event, skipping over any this subscriber was too slow to receive.
    /// Returns `None` once every publisher is gone.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_as_named_frames() {
        let event = Event::Notification(Notification::new(
            NotificationLevel::Success,
            "Wipe complete",
            "dev-1 wiped",
        ));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "notification");
        assert_eq!(json["data"]["level"], "success");
        assert_eq!(json["event"], event.name());
    }

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();

        for progress in [10u8, 20, 30] {
            bus.publish(Event::DeviceUpdate(DeviceUpdate {
                device_id: "dev-1".into(),
                status: "WipeInProgress".into(),
                progress: Some(progress),
                error_message: None,
                timestamp: Utc::now(),
            }));
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            match stream.next().await {
                Some(Event::DeviceUpdate(update)) => seen.push(update.progress.unwrap()),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(seen, vec![10, 20, 30]);
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(Event::SystemStatus(SystemStatus {
            connected_clients: 0,
            active_jobs: 0,
            devices: 0,
            timestamp: Utc::now(),
        })), 0);
    }
}
