/**
 * BROKER CONNECTION MANAGER - Sole owner of the MQTT session
 *
 * ROLE :
 * Keeps exactly one live broker session for the whole process, reconnects it
 * under a bounded policy and hands every inbound message to the event router.
 *
 * HOW IT WORKS :
 * - Dialer / Session = transport seam (rumqttc in production, scripted in tests)
 * - Link = current session + generation, behind one async mutex that guards
 *   connect, reconnect and publish
 * - ensure_connected() is single-flight: callers that queued behind a running
 *   sequence get its outcome instead of starting another one
 * - The receive side pushes LinkEvents into one queue; a single pump task
 *   drains it in arrival order into EventRouter::on_message
 * - An unexpected drop triggers exactly one immediate reconnect attempt;
 *   further recovery waits for the next ensure_connected()
 *
 * STATES :
 * Disconnected -> Connecting -> Connected -> Disconnected (error, drop, shutdown)
 */

pub mod rumqtt;

#[cfg(test)]
pub mod mock;

pub use rumqtt::RumqttDialer;

use crate::router::EventRouter;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("broker refused the protocol version")]
    BadProtocol,
    #[error("broker rejected the client identifier")]
    BadClientId,
    #[error("broker unreachable: {0}")]
    BrokerUnreachable(String),
    #[error("bad username or password")]
    BadCredentials,
    #[error("client not authorized")]
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("broker rejected publish (code {0})")]
    BrokerRejected(u8),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the transport reports back to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message { topic: String, payload: Vec<u8> },
    /// The session dialed as `generation` is gone.
    Dropped { generation: u64, reason: String },
}

#[async_trait]
pub trait Session: Send + Sync {
    async fn subscribe(&self, pattern: &str) -> Result<(), PublishError>;
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
    async fn disconnect(&self);
}

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a session. Inbound traffic and the eventual drop of this session
    /// are reported on `inbound`, tagged with `generation`.
    async fn dial(
        &self,
        generation: u64,
        inbound: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn Session>, ConnectError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            delay: Duration::from_secs(1),
        }
    }
}

struct Link {
    session: Option<Box<dyn Session>>,
    generation: u64,
}

pub struct ConnectionManager {
    dialer: Box<dyn Dialer>,
    patterns: BTreeSet<String>,
    policy: RetryPolicy,
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
    /// Generation of the live session, readable without the link lock.
    current_generation: AtomicU64,
    /// Completed ensure_connected sequences and the outcome of the last one.
    sequences: AtomicU64,
    last_outcome: AtomicBool,
    dials: AtomicU32,
    reconnects: AtomicU32,
    closed: AtomicBool,
    inbound_tx: mpsc::UnboundedSender<LinkEvent>,
    inbound_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
}

impl ConnectionManager {
    pub fn new(dialer: Box<dyn Dialer>, patterns: BTreeSet<String>, policy: RetryPolicy) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            dialer,
            patterns,
            policy,
            link: Mutex::new(Link {
                session: None,
                generation: 0,
            }),
            state_tx,
            current_generation: AtomicU64::new(0),
            sequences: AtomicU64::new(0),
            last_outcome: AtomicBool::new(false),
            dials: AtomicU32::new(0),
            reconnects: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            inbound_tx,
            inbound_rx: parking_lot::Mutex::new(Some(inbound_rx)),
        })
    }

    /// Spawns the message pump and the first connection attempt, then returns.
    pub fn start(self: &Arc<Self>, router: Arc<EventRouter>) {
        let Some(mut inbound) = self.inbound_rx.lock().take() else {
            warn!("connection manager already started");
            return;
        };

        let pump = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                match event {
                    LinkEvent::Message { topic, payload } => router.on_message(&topic, &payload),
                    LinkEvent::Dropped { generation, reason } => pump.handle_drop(generation, reason),
                }
            }
            debug!("inbound queue closed, pump stopped");
        });

        let first = Arc::clone(self);
        tokio::spawn(async move {
            if !first.ensure_connected().await {
                error!("initial broker connection failed, will retry on demand");
            }
        });
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Dials made after the very first one.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Dials the broker and subscribes to every pattern.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let mut link = self.link.lock().await;
        self.connect_locked(&mut link).await
    }

    /// Returns at once when connected. Otherwise runs one bounded retry
    /// sequence, or waits for the sequence already running and reports its
    /// outcome. May block for up to `retries * delay`; never call it from the
    /// message pump.
    pub async fn ensure_connected(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        if self.is_connected() {
            return true;
        }

        let seen = self.sequences.load(Ordering::Acquire);
        let mut link = self.link.lock().await;

        if link.session.is_some() && self.is_connected() {
            return true;
        }
        if self.sequences.load(Ordering::Acquire) != seen {
            return self.last_outcome.load(Ordering::Acquire);
        }

        let ok = self.run_sequence(&mut link).await;
        self.last_outcome.store(ok, Ordering::Release);
        self.sequences.fetch_add(1, Ordering::AcqRel);
        ok
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let link = self.link.lock().await;
        let Some(session) = link.session.as_ref() else {
            return Err(PublishError::NotConnected);
        };
        session.publish(topic, payload).await
    }

    /// Explicit disconnect. The drop that follows is not treated as unexpected
    /// and no further connection attempts are made.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut link = self.link.lock().await;
        link.generation += 1;
        self.current_generation.store(link.generation, Ordering::Release);
        if let Some(session) = link.session.take() {
            session.disconnect().await;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("broker connection shut down");
    }

    async fn run_sequence(&self, link: &mut Link) -> bool {
        let attempts = self.policy.retries.max(1);
        for attempt in 1..=attempts {
            match self.connect_locked(link).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!("broker connect attempt {attempt}/{attempts} failed: {e}");
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
            }
        }
        error!("broker still unreachable after {attempts} attempts");
        false
    }

    async fn connect_locked(&self, link: &mut Link) -> Result<(), ConnectError> {
        link.generation += 1;
        let generation = link.generation;
        self.current_generation.store(generation, Ordering::Release);

        if let Some(old) = link.session.take() {
            old.disconnect().await;
        }

        self.state_tx.send_replace(ConnectionState::Connecting);
        if self.dials.fetch_add(1, Ordering::Relaxed) > 0 {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }

        let session = match self.dialer.dial(generation, self.inbound_tx.clone()).await {
            Ok(session) => session,
            Err(e) => {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        for pattern in &self.patterns {
            if let Err(e) = session.subscribe(pattern).await {
                // Retire the generation first so the trailing drop reads as stale.
                link.generation += 1;
                self.current_generation.store(link.generation, Ordering::Release);
                session.disconnect().await;
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(ConnectError::BrokerUnreachable(format!("subscribe {pattern}: {e}")));
            }
        }

        link.session = Some(session);
        self.state_tx.send_replace(ConnectionState::Connected);
        info!("connected to broker (generation {generation}, {} subscriptions)", self.patterns.len());
        Ok(())
    }

    fn handle_drop(self: &Arc<Self>, generation: u64, reason: String) {
        if self.closed.load(Ordering::Acquire) || generation != self.current_generation.load(Ordering::Acquire) {
            debug!("ignoring drop of stale session {generation}: {reason}");
            return;
        }

        warn!("broker connection lost: {reason}");
        self.state_tx.send_replace(ConnectionState::Disconnected);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.recover_once(generation).await });
    }

    async fn recover_once(&self, dropped: u64) {
        let mut link = self.link.lock().await;
        if link.generation != dropped {
            // Someone reconnected while we waited for the lock.
            return;
        }
        match self.connect_locked(&mut link).await {
            Ok(()) => info!("reconnected after unexpected drop"),
            Err(e) => warn!("immediate reconnect failed: {e}; waiting for next request"),
        }
    }
}
