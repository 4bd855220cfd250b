//! Process-wide sync notifications.
//!
//! Fire-and-forget: emitting with no subscribers is not an error, and slow
//! subscribers drop the oldest events rather than blocking the sync engine.

use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStarted,
    SyncProgress {
        fraction: f32,
        message: String,
    },
    /// Record counts keyed by collection (downloads) or `orders` / `outbox`
    /// (uploads).
    SyncCompleted {
        counts: BTreeMap<String, usize>,
    },
    SyncFailed {
        reason: String,
    },
    OrderPlaced {
        order_id: String,
        merged: bool,
        synced: bool,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        trace!(?event, "emit");
        let _ = self.tx.send(event);
    }

    pub fn progress(&self, fraction: f32, message: impl Into<String>) {
        self.emit(SyncEvent::SyncProgress {
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
        });
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
    fn test_emit_without_subscribers_is_silent() {
        EventBus::new().emit(SyncEvent::SyncStarted);
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SyncEvent::SyncStarted);
        bus.progress(1.5, "menu_items");

        assert_eq!(rx.recv().await.unwrap(), SyncEvent::SyncStarted);
        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::SyncProgress {
                fraction: 1.0,
                message: "menu_items".into()
            }
        );
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(SyncEvent::SyncFailed {
            reason: "offline".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "sync_failed", "reason": "offline"}));
    }
}
