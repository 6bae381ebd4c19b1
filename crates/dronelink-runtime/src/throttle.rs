//! [`ThrottleController`] – absolute set-points to discrete step commands.
//!
//! The downstream control surface only understands "increase" (`k`) and
//! "decrease" (`j`) key presses. A [`ThrottleController::request`] for an
//! absolute value is turned into one adjustment routine that, per step,
//! enqueues a synthetic press, moves the shared [`ThrottleLevel`] by one
//! step, publishes a `throttle_status` envelope, and pauses. The routine
//! finishes with exactly one matching release.
//!
//! # Supersede, don't queue
//!
//! At most one routine runs at a time. A new request cancels the running
//! routine, waits for it to emit its release, and then computes its own
//! step count against the level at that moment. Only the latest target
//! matters.
//!
//! Direct operator steps ([`ThrottleController::apply_direct`]) bypass the
//! routine. Both paths update the level through an atomic read-modify-write,
//! so neither can lose the other's step.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dronelink_middleware::{ClientRegistry, EventQueue};
use dronelink_types::{Envelope, Event, EventKind, StepDirection, ThrottleLevel};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

/// Default pause between two synthetic steps.
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(50);

/// Tuning for a [`ThrottleController`].
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Starting value, clamped and quantized.
    pub initial: f64,
    pub step_delay: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            initial: 0.05,
            step_delay: DEFAULT_STEP_DELAY,
        }
    }
}

/// Handle to the routine currently in flight.
struct Adjustment {
    cancel: CancellationToken,
    /// Cancelled when the routine has finished, including its release.
    done: CancellationToken,
}

impl Adjustment {
    fn is_running(&self) -> bool {
        !self.done.is_cancelled()
    }
}

pub struct ThrottleController {
    level: Arc<ThrottleLevel>,
    queue: Arc<EventQueue>,
    registry: Arc<ClientRegistry>,
    step_delay: Duration,
    slot: Mutex<Option<Adjustment>>,
}

impl ThrottleController {
    pub fn new(
        config: ThrottleConfig,
        queue: Arc<EventQueue>,
        registry: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            level: Arc::new(ThrottleLevel::new(config.initial)),
            queue,
            registry,
            step_delay: config.step_delay,
            slot: Mutex::new(None),
        }
    }

    /// Shared read handle for status reporting.
    pub fn level(&self) -> Arc<ThrottleLevel> {
        Arc::clone(&self.level)
    }

    pub fn value(&self) -> f64 {
        self.level.value()
    }

    /// Move towards `target`, superseding any routine in flight.
    ///
    /// `target` is clamped to `[0, 1]` and quantized to the step size. Must
    /// be called from within a Tokio runtime.
    ///
    /// Returns `false` when nothing had to be done: no routine was running
    /// and the level already equals the quantized target.
    pub fn request(&self, target: f64) -> bool {
        let target_steps = ThrottleLevel::quantize(target);
        let mut slot = self.lock();

        let previous = slot.take();
        let in_flight = previous.as_ref().is_some_and(Adjustment::is_running);
        if !in_flight && target_steps == self.level.steps() {
            debug!(target, "throttle already at target");
            return false;
        }

        if let Some(prev) = &previous
            && prev.is_running()
        {
            debug!(target, "superseding throttle adjustment");
            prev.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let routine = Routine {
            level: Arc::clone(&self.level),
            queue: Arc::clone(&self.queue),
            registry: Arc::clone(&self.registry),
            step_delay: self.step_delay,
            target_steps,
            cancel: cancel.clone(),
            predecessor: previous.map(|p| p.done),
            done: done.clone().drop_guard(),
        };
        tokio::spawn(routine.run());
        *slot = Some(Adjustment { cancel, done });
        true
    }

    /// Apply one operator-driven step immediately and publish the new value.
    pub fn apply_direct(&self, direction: StepDirection) -> f64 {
        let value = self.level.step(direction);
        debug!(?direction, value, "direct throttle step");
        self.registry.publish(&Envelope::throttle_status(value));
        value
    }

    /// `true` while an adjustment routine has not emitted its release yet.
    pub fn is_adjusting(&self) -> bool {
        self.lock().as_ref().is_some_and(Adjustment::is_running)
    }

    /// Resolve once the routine in flight (if any) has finished.
    pub async fn wait_idle(&self) {
        let done = self.lock().as_ref().map(|a| a.done.clone());
        if let Some(done) = done {
            done.cancelled().await;
        }
    }

    /// Stop the routine in flight. It still emits its release.
    pub fn cancel(&self) {
        if let Some(adjustment) = self.lock().as_ref() {
            adjustment.cancel.cancel();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Adjustment>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One adjustment routine, owned by its task.
struct Routine {
    level: Arc<ThrottleLevel>,
    queue: Arc<EventQueue>,
    registry: Arc<ClientRegistry>,
    step_delay: Duration,
    target_steps: u32,
    cancel: CancellationToken,
    predecessor: Option<CancellationToken>,
    done: DropGuard,
}

impl Routine {
    async fn run(self) {
        let Routine {
            level,
            queue,
            registry,
            step_delay,
            target_steps,
            cancel,
            predecessor,
            done: _done,
        } = self;

        // The predecessor's release must be enqueued before any of our presses.
        if let Some(previous) = predecessor {
            previous.cancelled().await;
        }
        if cancel.is_cancelled() {
            return;
        }

        let current = level.steps();
        let direction = match target_steps.cmp(&current) {
            std::cmp::Ordering::Greater => StepDirection::Up,
            std::cmp::Ordering::Less => StepDirection::Down,
            std::cmp::Ordering::Equal => return,
        };
        let steps = target_steps.abs_diff(current);
        let key = direction.key();
        info!(
            from = ThrottleLevel::steps_to_value(current),
            to = ThrottleLevel::steps_to_value(target_steps),
            steps,
            "throttle adjustment started"
        );

        let mut sent = 0u32;
        for _ in 0..steps {
            if cancel.is_cancelled() {
                break;
            }
            queue.enqueue(Event::synthetic(EventKind::Press(key)));
            sent += 1;
            let value = level.step(direction);
            registry.publish(&Envelope::throttle_status(value));

            tokio::select! {
                _ = tokio::time::sleep(step_delay) => {}
                _ = cancel.cancelled() => break,
            }
        }

        if sent > 0 {
            queue.enqueue(Event::synthetic(EventKind::Release(key)));
        }
        info!(sent, value = level.value(), cancelled = cancel.is_cancelled(), "throttle adjustment finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dronelink_types::{Key, Origin, Protocol};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    struct Fixture {
        controller: ThrottleController,
        queue: Arc<EventQueue>,
        observer: mpsc::Receiver<String>,
        _registry: Arc<ClientRegistry>,
    }

    fn fixture(initial: f64, step_delay: Duration) -> Fixture {
        let queue = Arc::new(EventQueue::new());
        let registry = Arc::new(ClientRegistry::new());
        let (_id, observer) =
            registry.register(SocketAddr::from(([127, 0, 0, 1], 1)), Protocol::Ws);
        let controller = ThrottleController::new(
            ThrottleConfig {
                initial,
                step_delay,
            },
            Arc::clone(&queue),
            Arc::clone(&registry),
        );
        Fixture {
            controller,
            queue,
            observer,
            _registry: registry,
        }
    }

    fn count(events: &[Event], kind: EventKind) -> usize {
        events.iter().filter(|e| e.kind == kind).count()
    }

    fn throttle_envelopes(observer: &mut mpsc::Receiver<String>) -> Vec<f64> {
        let mut values = Vec::new();
        while let Ok(text) = observer.try_recv() {
            let json: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(json["type"], "throttle_status");
            values.push(json["throttle"].as_f64().unwrap());
        }
        values
    }

    #[tokio::test]
    async fn request_emits_n_presses_n_envelopes_and_one_release() {
        let mut f = fixture(0.05, Duration::from_millis(1));
        assert!(f.controller.request(0.3));
        f.controller.wait_idle().await;

        let events = f.queue.drain_priority();
        assert_eq!(count(&events, EventKind::Press(Key::K)), 5);
        assert_eq!(count(&events, EventKind::Release(Key::K)), 1);
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|e| e.origin == Origin::Synthetic));

        assert_eq!(throttle_envelopes(&mut f.observer), vec![0.1, 0.15, 0.2, 0.25, 0.3]);
        assert_eq!(f.controller.value(), 0.3);
        assert!(!f.controller.is_adjusting());
    }

    #[tokio::test]
    async fn decreasing_uses_the_decrease_key() {
        let f = fixture(0.5, Duration::from_millis(1));
        f.controller.request(0.4);
        f.controller.wait_idle().await;

        let wire: Vec<String> = f.queue.drain_priority().iter().map(Event::to_wire).collect();
        assert_eq!(wire, vec!["release:j", "press:j", "press:j"]);
        assert_eq!(f.controller.value(), 0.4);
    }

    #[tokio::test]
    async fn out_of_range_targets_are_clamped() {
        let f = fixture(0.05, Duration::from_millis(1));
        f.controller.request(1.5);
        f.controller.wait_idle().await;
        assert_eq!(f.controller.value(), 1.0);

        f.controller.request(-0.3);
        f.controller.wait_idle().await;
        assert_eq!(f.controller.value(), 0.0);
    }

    #[tokio::test]
    async fn request_for_current_value_is_a_noop() {
        let f = fixture(0.05, Duration::from_millis(1));
        assert!(!f.controller.request(0.05));
        // 0.06 quantizes to 0.05 as well.
        assert!(!f.controller.request(0.06));
        assert!(!f.controller.is_adjusting());
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn new_request_supersedes_the_running_routine() {
        let f = fixture(0.05, Duration::from_millis(20));
        f.controller.request(1.0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.controller.request(0.0);
        f.controller.wait_idle().await;

        let events = f.queue.drain_priority();
        let ups = count(&events, EventKind::Press(Key::K));
        let downs = count(&events, EventKind::Press(Key::J));
        assert!(ups > 0 && ups < 19, "first routine must be cut short, sent {ups}");
        assert_eq!(downs, ups + 1);
        assert_eq!(count(&events, EventKind::Release(Key::K)), 1);
        assert_eq!(count(&events, EventKind::Release(Key::J)), 1);
        assert_eq!(f.controller.value(), 0.0);
    }

    #[tokio::test]
    async fn direct_steps_do_not_change_the_routine_step_count() {
        let mut f = fixture(0.05, Duration::from_millis(10));
        f.controller.request(0.3);
        tokio::time::sleep(Duration::from_millis(15)).await;
        f.controller.apply_direct(StepDirection::Up);
        f.controller.wait_idle().await;

        let events = f.queue.drain_priority();
        assert_eq!(count(&events, EventKind::Press(Key::K)), 5);
        assert_eq!(count(&events, EventKind::Release(Key::K)), 1);
        assert_eq!(throttle_envelopes(&mut f.observer).len(), 6);
        assert_eq!(f.controller.value(), 0.35);
    }

    #[tokio::test]
    async fn cancelled_routine_still_releases() {
        let f = fixture(0.0, Duration::from_millis(50));
        f.controller.request(1.0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.controller.cancel();
        f.controller.wait_idle().await;

        let events = f.queue.drain_priority();
        assert_eq!(count(&events, EventKind::Release(Key::K)), 1);
        assert!(count(&events, EventKind::Press(Key::K)) >= 1);
        assert!(f.controller.value() < 1.0);
    }

    #[test]
    fn apply_direct_saturates_and_publishes() {
        let mut f = fixture(1.0, Duration::from_millis(1));
        assert_eq!(f.controller.apply_direct(StepDirection::Up), 1.0);
        assert_eq!(f.controller.apply_direct(StepDirection::Down), 0.95);
        assert_eq!(throttle_envelopes(&mut f.observer), vec![1.0, 0.95]);
    }
}
