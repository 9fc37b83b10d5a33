//! Broadcast + history event bus.

use std::{collections::VecDeque, sync::RwLock};

use tokio::sync::broadcast;

use crate::FlowEvent;

/// Default number of events retained for late subscribers.
const HISTORY_LEN: usize = 1024;

/// Live channel capacity before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 10_000;

/// Event bus with broadcast and bounded history.
///
/// Every subscriber sees each event published after it subscribed exactly
/// once. History lets a late observer catch up on recent transitions.
pub struct EventBus {
    history: RwLock<VecDeque<FlowEvent>>,
    history_len: usize,
    sender: broadcast::Sender<FlowEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default history length.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(HISTORY_LEN)
    }

    /// Create a bus retaining at most `history_len` past events.
    #[must_use]
    pub fn with_history(history_len: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            history: RwLock::new(VecDeque::with_capacity(history_len.min(64))),
            history_len,
            sender,
        }
    }

    /// Publish an event to live subscribers and history.
    pub fn publish(&self, event: FlowEvent) {
        tracing::trace!(?event, "publishing event");
        let _ = self.sender.send(event.clone()); // no subscribers is fine

        if self.history_len == 0 {
            return;
        }
        let Ok(mut history) = self.history.write() else {
            return;
        };
        while history.len() >= self.history_len {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<FlowEvent> {
        self.history
            .read()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    use super::*;

    fn cancelled() -> FlowEvent {
        FlowEvent::WorkflowCancelled {
            workflow_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_each_event_once() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let first = cancelled();
        let second = cancelled();
        bus.publish(first.clone());
        bus.publish(second.clone());

        assert_eq!(assert_ok!(rx.recv().await), first);
        assert_eq!(assert_ok!(rx.recv().await), second);
        assert_err!(rx.try_recv());
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::with_history(2);
        let events: Vec<_> = (0..3).map(|_| cancelled()).collect();
        for event in &events {
            bus.publish(event.clone());
        }
        assert_eq!(bus.history(), events[1..].to_vec());
    }
}
