//! Event Bus - broadcast stream of kernel activity
//!
//! Components emit events; observers (CLI, tests, loggers) subscribe. Emission
//! never blocks and never fails: with no subscribers the event is dropped, and
//! slow subscribers lose the oldest events.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::KernelEvent;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Central event bus for kernel activity
pub struct EventBus {
    tx: broadcast::Sender<KernelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit an event to all subscribers (fire-and-forget)
    pub fn emit(&self, event: KernelEvent) {
        debug!(
            event_type = event.event_type(),
            cell_id = %event.cell_id(),
            "EventBus::emit"
        );
        // Ignore send errors (no subscribers is OK)
        let _ = self.tx.send(event);
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CellId, Mode};

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(KernelEvent::ModeChosen {
            cell_id: CellId::from_string("abc123-cell-root"),
            mode: Mode::Solo,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "mode-chosen");
    }

    #[test]
    fn test_emit_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(KernelEvent::CellKilled {
            cell_id: CellId::from_string("x"),
        });
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(KernelEvent::CellKilled {
            cell_id: CellId::from_string("x"),
        });
        assert_eq!(rx1.recv().await.unwrap().event_type(), "cell-killed");
        assert_eq!(rx2.recv().await.unwrap().event_type(), "cell-killed");
    }
}
