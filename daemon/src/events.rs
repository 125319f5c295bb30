use std::collections::VecDeque;
use std::sync::Mutex;

use common::{EventLevel, UploadEvent};
use tokio::sync::broadcast;

/// Events retained for late subscribers (UI reload, `watch` reconnect).
pub const DEFAULT_HISTORY: usize = 100;

const CHANNEL_CAPACITY: usize = 256;

/// Multi-producer fan-out for progress events. Publishing is non-blocking
/// and infallible from the producer's point of view: a slow or absent
/// subscriber can lag or miss events, but it can never stall an upload.
pub struct EventBus {
    tx: broadcast::Sender<UploadEvent>,
    history: Mutex<VecDeque<UploadEvent>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn publish(&self, event: UploadEvent) {
        match event.level {
            EventLevel::Error => log::error!("{}", event.message),
            _ => log::info!("{}", event.message),
        }

        // The lock is held across the send so a concurrent subscribe()
        // sees each event exactly once: in the replay or live, never both.
        let mut history = self.history.lock().unwrap();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
        let _ = self.tx.send(event);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.publish(UploadEvent::new(EventLevel::Info, message));
    }

    pub fn success(&self, message: impl Into<String>) {
        self.publish(UploadEvent::new(EventLevel::Success, message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(UploadEvent::new(EventLevel::Error, message));
    }

    /// Returns the retained history plus a live receiver. Dropping the
    /// receiver is the whole teardown; publishers are unaffected.
    pub fn subscribe(&self) -> (Vec<UploadEvent>, broadcast::Receiver<UploadEvent>) {
        let history = self.history.lock().unwrap();
        let rx = self.tx.subscribe();
        (history.iter().cloned().collect(), rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(10);
        bus.info("nobody is listening");
        bus.error("still fine");
    }

    #[test]
    fn history_is_bounded_and_keeps_newest() {
        let bus = EventBus::new(3);
        for i in 0..10 {
            bus.info(format!("event {}", i));
        }
        let (history, _rx) = bus.subscribe();
        let messages: Vec<_> = history.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["event 7", "event 8", "event 9"]);
    }

    #[tokio::test]
    async fn subscriber_gets_replay_then_live_in_order() {
        let bus = EventBus::new(10);
        bus.info("before");
        let (history, mut rx) = bus.subscribe();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "before");

        bus.success("after");
        let live = rx.recv().await.unwrap();
        assert_eq!(live.message, "after");
        assert_eq!(live.level, EventLevel::Success);
    }
}
