use crate::sample::Sample;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Events pushed to live subscribers, serialized as `{"type": ..., ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    /// First message every subscriber receives.
    ConnectionStatus {
        connected: bool,
        #[serde(rename = "modbusConnected")]
        modbus_connected: bool,
    },
    /// Link transitions reported by the reconnection supervisor.
    ModbusStatus { connected: bool, message: String },
    EnergyReading(Sample),
}

impl HubEvent {
    pub fn modbus_status(connected: bool, message: impl Into<String>) -> Self {
        HubEvent::ModbusStatus {
            connected,
            message: message.into(),
        }
    }
}

/// Stable handle for one registered subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

pub type SubscriberSender = mpsc::Sender<Arc<str>>;

/// Fan-out of hub events to every registered channel.
///
/// Delivery never waits: a channel that is full or closed is dropped from the
/// registry on the spot and the rest still receive the event.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<SubscriberId, SubscriberSender>>,
    next_id: AtomicU64,
    modbus_connected: AtomicBool,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `channel` and sends it the current connection status.
    ///
    /// Returns `None` when the channel cannot take that first message.
    pub fn subscribe(&self, channel: SubscriberSender) -> Option<SubscriberId> {
        let greeting = HubEvent::ConnectionStatus {
            connected: true,
            modbus_connected: self.modbus_connected(),
        };
        let payload = match serde_json::to_string(&greeting) {
            Ok(json) => Arc::<str>::from(json),
            Err(e) => {
                error!(error = %e, "Failed to serialize connection status");
                return None;
            }
        };
        if channel.try_send(payload).is_err() {
            return None;
        }

        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.lock();
        subscribers.insert(id, channel);
        debug!(subscriber = id.0, total = subscribers.len(), "Subscriber registered");
        Some(id)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(subscriber = id.0, "Subscriber removed");
        }
        removed
    }

    /// Serializes `event` once and offers it to every subscriber.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, event: &HubEvent) -> usize {
        if let HubEvent::ModbusStatus { connected, .. } = event {
            self.modbus_connected.store(*connected, Ordering::Relaxed);
        }

        let payload: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                error!(error = %e, "Failed to serialize hub event");
                return 0;
            }
        };

        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|id, channel| match channel.try_send(payload.clone()) {
            Ok(()) => true,
            Err(e) => {
                debug!(subscriber = id.0, error = %e, "Dropping subscriber");
                false
            }
        });
        let delivered = subscribers.len();
        if delivered < before {
            debug!(pruned = before - delivered, remaining = delivered, "Pruned subscribers");
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Last link state announced through a `modbus_status` event.
    pub fn modbus_connected(&self) -> bool {
        self.modbus_connected.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, SubscriberSender>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
