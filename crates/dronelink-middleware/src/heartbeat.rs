//! [`HeartbeatMonitor`] – keep-alive originator.
//!
//! Runs on its own cadence, independent of event traffic. While the link is
//! [`LinkState::Connected`](dronelink_types::LinkState::Connected) every beat sends the `heartbeat:ping` sentinel
//! downstream and publishes a `heartbeat` envelope to observers. Beats are
//! skipped while the link is in any other state; a failed beat is logged
//! and never retried beyond the link's own policy.

use std::sync::Arc;
use std::time::Duration;

use dronelink_types::{Delivery, Envelope, Event};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::link::ReliableLink;
use crate::registry::ClientRegistry;

/// Default interval between two beats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

pub struct HeartbeatMonitor {
    link: Arc<ReliableLink>,
    registry: Arc<ClientRegistry>,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(link: Arc<ReliableLink>, registry: Arc<ClientRegistry>) -> Self {
        Self {
            link,
            registry,
            interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Perform one beat.
    ///
    /// Returns `None` when the link was not connected and nothing was sent.
    pub async fn beat(&self) -> Option<Delivery> {
        if !self.link.state().is_connected() {
            debug!(state = %self.link.state(), "heartbeat skipped");
            return None;
        }
        self.registry.publish(&Envelope::heartbeat());
        let outcome = self.link.send(&Event::heartbeat()).await;
        if outcome == Delivery::Dropped {
            warn!("heartbeat not delivered");
        }
        Some(outcome)
    }

    /// Beat every `interval` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "heartbeat monitor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.beat().await;
                }
            }
        }
        info!("heartbeat monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::{ScriptedConnector, fast_config};
    use dronelink_types::LinkState;

    fn fixture(connector: ScriptedConnector) -> (HeartbeatMonitor, Arc<ReliableLink>, Arc<ClientRegistry>) {
        let link = Arc::new(ReliableLink::new(
            connector,
            fast_config(),
            CancellationToken::new(),
        ));
        let registry = Arc::new(ClientRegistry::new());
        let monitor = HeartbeatMonitor::new(Arc::clone(&link), Arc::clone(&registry));
        (monitor, link, registry)
    }

    #[tokio::test]
    async fn beat_is_skipped_while_disconnected() {
        let connector = ScriptedConnector::default();
        let (monitor, link, registry) = fixture(connector.clone());
        let (_id, mut rx) = registry.register(([127, 0, 0, 1], 9).into(), dronelink_types::Protocol::Ws);

        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(monitor.beat().await, None);
        assert_eq!(connector.attempt_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn beat_sends_sentinel_and_publishes_envelope() {
        let connector = ScriptedConnector::default();
        let (monitor, link, registry) = fixture(connector.clone());
        let (_id, mut rx) = registry.register(([127, 0, 0, 1], 9).into(), dronelink_types::Protocol::Ws);
        link.connect().await.unwrap();

        assert_eq!(monitor.beat().await, Some(Delivery::Delivered));
        assert_eq!(connector.delivered(), vec!["heartbeat:ping"]);

        let text = rx.try_recv().unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["status"], "active");
    }

    #[tokio::test]
    async fn run_beats_on_its_cadence_and_stops_on_shutdown() {
        let connector = ScriptedConnector::default();
        let (monitor, link, _registry) = fixture(connector.clone());
        link.connect().await.unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            monitor
                .with_interval(Duration::from_millis(10))
                .run(shutdown.clone()),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("monitor must stop")
            .unwrap();

        let beats = connector.delivered().len();
        assert!(beats >= 2, "expected several beats, got {beats}");
        assert!(connector.delivered().iter().all(|f| f == "heartbeat:ping"));
    }
}
