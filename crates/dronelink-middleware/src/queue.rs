//! Pending outbound events with release-first drain order.
//!
//! The queue is a [`VecDeque`] behind a [`std::sync::Mutex`]. The critical
//! section of every method is a handful of pointer moves and never spans an
//! `.await`, so `enqueue` never blocks meaningfully and `drain_priority` is
//! atomic with respect to concurrent `enqueue` calls: an event is either in
//! the returned batch or left for the next one, never both and never lost.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dronelink_types::{Event, EventKind, Origin};
use tokio::sync::Notify;
use tracing::debug;

/// Thread-safe queue of events waiting for the drain loop.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<VecDeque<Event>>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `event` in arrival order and wake the drain loop.
    ///
    /// An operator `press` whose key already has an identical press pending
    /// is discarded (held keys auto-repeat). Synthetic presses are always
    /// kept because the throttle routine counts them.
    ///
    /// Returns `false` when the event was discarded as a duplicate.
    pub fn enqueue(&self, event: Event) -> bool {
        {
            let mut events = self.lock();
            if event.origin == Origin::Operator
                && matches!(event.kind, EventKind::Press(_))
                && events
                    .iter()
                    .any(|pending| pending.origin == Origin::Operator && pending.same_command(&event))
            {
                debug!(event = %event.kind, "duplicate press already pending");
                return false;
            }
            events.push_back(event);
        }
        self.notify.notify_one();
        true
    }

    /// Take every queued event, releases first.
    ///
    /// Relative arrival order is preserved inside each partition. The queue
    /// is left empty.
    pub fn drain_priority(&self) -> Vec<Event> {
        let drained = std::mem::take(&mut *self.lock());
        let (mut releases, others): (Vec<Event>, Vec<Event>) =
            drained.into_iter().partition(|e| e.kind.is_release());
        releases.extend(others);
        releases
    }

    /// Number of events currently waiting.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolve once an `enqueue` has happened since the last wake-up.
    ///
    /// A notification sent while nobody was waiting is remembered, so an
    /// enqueue racing with an empty drain is never missed.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        // The guarded data is a plain VecDeque; a panic elsewhere cannot
        // leave it half-updated.
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dronelink_types::Key;
    use std::sync::Arc;
    use std::time::Duration;

    fn wire(events: &[Event]) -> Vec<String> {
        events.iter().map(Event::to_wire).collect()
    }

    #[test]
    fn releases_drain_before_presses() {
        let queue = EventQueue::new();
        queue.enqueue(Event::from_wire("press:w").unwrap());
        queue.enqueue(Event::from_wire("release:w").unwrap());
        queue.enqueue(Event::from_wire("press:a").unwrap());

        let batch = queue.drain_priority();
        assert_eq!(wire(&batch), vec!["release:w", "press:w", "press:a"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn relative_order_is_kept_within_each_partition() {
        let queue = EventQueue::new();
        for text in [
            "press:w", "release:a", "heartbeat:ping", "release:s", "arm", "press:d", "release:q",
        ] {
            queue.enqueue(Event::from_wire(text).unwrap());
        }

        let batch = queue.drain_priority();
        assert_eq!(
            wire(&batch),
            vec![
                "release:a",
                "release:s",
                "release:q",
                "press:w",
                "heartbeat:ping",
                "arm",
                "press:d"
            ]
        );
    }

    #[test]
    fn duplicate_operator_press_is_discarded_while_pending() {
        let queue = EventQueue::new();
        assert!(queue.enqueue(Event::from_wire("press:w").unwrap()));
        assert!(!queue.enqueue(Event::from_wire("press:w").unwrap()));
        assert_eq!(queue.len(), 1);

        // Once drained, the same press is accepted again.
        queue.drain_priority();
        assert!(queue.enqueue(Event::from_wire("press:w").unwrap()));
    }

    #[test]
    fn repeated_releases_and_raw_commands_are_kept() {
        let queue = EventQueue::new();
        assert!(queue.enqueue(Event::from_wire("release:w").unwrap()));
        assert!(queue.enqueue(Event::from_wire("release:w").unwrap()));
        assert!(queue.enqueue(Event::from_wire("land").unwrap()));
        assert!(queue.enqueue(Event::from_wire("land").unwrap()));
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn synthetic_presses_are_never_deduplicated() {
        let queue = EventQueue::new();
        for _ in 0..3 {
            assert!(queue.enqueue(Event::synthetic(EventKind::Press(Key::K))));
        }
        // An operator press does not collide with synthetic ones either.
        assert!(queue.enqueue(Event::operator(EventKind::Press(Key::K))));
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn drain_of_empty_queue_is_empty() {
        let queue = EventQueue::new();
        assert!(queue.drain_priority().is_empty());
    }

    #[test]
    fn concurrent_enqueue_and_drain_lose_nothing() {
        let queue = Arc::new(EventQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let text = if i % 2 == 0 { "release:w" } else { "arm" };
                        queue.enqueue(Event::from_wire(text).unwrap());
                    }
                })
            })
            .collect();

        let mut seen = 0;
        while producers.iter().any(|p| !p.is_finished()) {
            seen += queue.drain_priority().len();
        }
        for p in producers {
            p.join().unwrap();
        }
        seen += queue.drain_priority().len();

        assert_eq!(seen, 1000);
    }

    #[tokio::test]
    async fn enqueue_wakes_a_waiting_drainer() {
        let queue = Arc::new(EventQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue.notified().await;
                queue.drain_priority()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(Event::from_wire("press:c").unwrap());

        let batch = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drainer must wake")
            .unwrap();
        assert_eq!(wire(&batch), vec!["press:c"]);
    }

    #[tokio::test]
    async fn notification_before_wait_is_not_lost() {
        let queue = EventQueue::new();
        queue.enqueue(Event::from_wire("press:c").unwrap());
        tokio::time::timeout(Duration::from_millis(100), queue.notified())
            .await
            .expect("stored permit must resolve immediately");
    }
}
