//! [`RelayService`] – the composition root.
//!
//! Owns the event queue, the reliable link, the throttle controller, the
//! observer registry (and optionally a [`HubServer`] serving it) and the
//! heartbeat monitor, and runs the drain loop:
//!
//! 1. take the release-first batch from the queue;
//! 2. throttle set-points go to [`ThrottleController::request`];
//! 3. operator `press:k` / `press:j` apply one direct step, then continue
//!    like every other event;
//! 4. every other event goes through [`ReliableLink::send`] and its outcome
//!    is published as an `event` envelope;
//! 5. pause a few milliseconds between events.
//!
//! The loop ends when the service token is cancelled, either by the
//! operator or by the link once its reconnect budget is spent.

use std::sync::Arc;
use std::time::Duration;

use dronelink_hub::{HubContext, HubServer};
use dronelink_middleware::{
    ClientRegistry, Connector, DEFAULT_HEARTBEAT_INTERVAL, EventQueue, HeartbeatMonitor,
    LinkConfig, LinkError, ReliableLink,
};
use dronelink_types::{
    Delivery, Envelope, Event, EventKind, LinkState, Origin, RelayError, StepDirection,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::throttle::{ThrottleConfig, ThrottleController};

/// Default pause between two drained events.
pub const DEFAULT_DRAIN_PAUSE: Duration = Duration::from_millis(5);

/// Startup configuration for a [`RelayService`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub link: LinkConfig,
    pub throttle: ThrottleConfig,
    pub heartbeat_interval: Duration,
    pub drain_pause: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            throttle: ThrottleConfig::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            drain_pause: DEFAULT_DRAIN_PAUSE,
        }
    }
}

pub struct RelayService {
    queue: Arc<EventQueue>,
    link: Arc<ReliableLink>,
    registry: Arc<ClientRegistry>,
    throttle: ThrottleController,
    hub: Option<HubServer>,
    heartbeat_interval: Duration,
    drain_pause: Duration,
    shutdown: CancellationToken,
}

impl RelayService {
    /// Wire up every component around `connector`. Nothing runs until
    /// [`RelayService::run`].
    pub fn new(connector: impl Connector + 'static, config: RelayConfig) -> Self {
        let shutdown = CancellationToken::new();
        let queue = Arc::new(EventQueue::new());
        let registry = Arc::new(ClientRegistry::new());
        let link = Arc::new(ReliableLink::new(connector, config.link, shutdown.clone()));
        let throttle =
            ThrottleController::new(config.throttle, Arc::clone(&queue), Arc::clone(&registry));
        Self {
            queue,
            link,
            registry,
            throttle,
            hub: None,
            heartbeat_interval: config.heartbeat_interval,
            drain_pause: config.drain_pause,
            shutdown,
        }
    }

    /// Handles a [`HubServer`] needs to serve this service's observers.
    pub fn hub_context(&self) -> HubContext {
        HubContext {
            registry: Arc::clone(&self.registry),
            queue: Arc::clone(&self.queue),
            link_state: self.link.subscribe_state(),
            throttle: self.throttle.level(),
        }
    }

    /// Serve observers with `hub` while the service runs.
    pub fn attach_hub(&mut self, hub: HubServer) {
        self.hub = Some(hub);
    }

    /// Producer handle for local input sources.
    pub fn queue(&self) -> Arc<EventQueue> {
        Arc::clone(&self.queue)
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn link(&self) -> Arc<ReliableLink> {
        Arc::clone(&self.link)
    }

    pub fn throttle(&self) -> &ThrottleController {
        &self.throttle
    }

    /// Cancelling this token stops the service. The link cancels it too
    /// once its reconnect budget is spent.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shut down.
    ///
    /// # Errors
    ///
    /// [`RelayError::LinkExhausted`] when the service stopped because the
    /// downstream link could not be re-established, [`RelayError::Bind`] if
    /// the attached hub cannot bind its port.
    pub async fn run(mut self) -> Result<(), RelayError> {
        info!(endpoint = %self.link.endpoint(), "relay service starting");
        let mut tasks = JoinSet::new();

        if let Some(hub) = self.hub.take() {
            let listener = hub.bind().await?;
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                if let Err(e) = hub.serve(listener, shutdown).await {
                    error!(error = %e, "observer hub failed");
                }
            });
        }

        match self.link.connect().await {
            Ok(()) => {}
            Err(LinkError::Exhausted { attempts }) => {
                self.shutdown.cancel();
                while tasks.join_next().await.is_some() {}
                return Err(RelayError::LinkExhausted { attempts });
            }
            Err(e) => debug!(error = %e, "initial connect interrupted"),
        }

        let heartbeat = HeartbeatMonitor::new(Arc::clone(&self.link), Arc::clone(&self.registry))
            .with_interval(self.heartbeat_interval);
        tasks.spawn(heartbeat.run(self.shutdown.clone()));

        self.drain_loop().await;

        self.throttle.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "relay task ended abnormally");
            }
        }

        if self.link.state() == LinkState::Stopped {
            let attempts = self.link.config().reconnect_attempts;
            error!(attempts, "relay service stopped: downstream link exhausted");
            return Err(RelayError::LinkExhausted { attempts });
        }
        self.link.close().await;
        info!("relay service stopped");
        Ok(())
    }

    async fn drain_loop(&self) {
        loop {
            let batch = self.queue.drain_priority();
            if batch.is_empty() {
                let stop = tokio::select! {
                    _ = self.shutdown.cancelled() => true,
                    _ = self.queue.notified() => false,
                };
                if stop {
                    break;
                }
                continue;
            }

            let total = batch.len();
            for (i, event) in batch.into_iter().enumerate() {
                if self.shutdown.is_cancelled() {
                    warn!(discarded = total - i, "shutting down with undelivered events");
                    return;
                }
                self.dispatch(event).await;
                tokio::time::sleep(self.drain_pause).await;
            }
        }
    }

    /// Route one drained event.
    ///
    /// Returns the delivery outcome, or `None` for set-points, which are
    /// handled locally and never reach the link.
    pub async fn dispatch(&self, event: Event) -> Option<Delivery> {
        if let EventKind::ThrottleSet(target) = event.kind {
            self.throttle.request(target);
            return None;
        }

        if event.origin == Origin::Operator
            && let EventKind::Press(key) = event.kind
            && let Some(direction) = StepDirection::from_key(key)
        {
            self.throttle.apply_direct(direction);
        }

        let outcome = self.link.send(&event).await;
        self.registry.publish(&Envelope::event_result(&event, outcome));
        Some(outcome)
    }
}
