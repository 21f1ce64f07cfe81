//! Scripted broker for tests.

use super::{ConnectError, Dialer, LinkEvent, PublishError, Session};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct Script {
    dials: u32,
    fail_next: u32,
    failure: Option<ConnectError>,
    fail_always: bool,
    reject_code: Option<u8>,
    transport_error: Option<String>,
    subscribe_error: Option<String>,
    publishes: Vec<(String, Vec<u8>)>,
    subscriptions: Vec<String>,
    disconnects: u32,
    live: Option<(u64, mpsc::UnboundedSender<LinkEvent>)>,
}

/// Cloning shares the script, so a test keeps a handle while the manager
/// owns the dialer.
#[derive(Clone, Default)]
pub struct MockDialer {
    script: Arc<Mutex<Script>>,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_always(&self, cause: ConnectError) {
        let mut s = self.script.lock();
        s.failure = Some(cause);
        s.fail_always = true;
    }

    pub fn fail_times(&self, n: u32, cause: ConnectError) {
        let mut s = self.script.lock();
        s.failure = Some(cause);
        s.fail_next = n;
    }

    pub fn heal(&self) {
        let mut s = self.script.lock();
        s.failure = None;
        s.subscribe_error = None;
        s.fail_always = false;
        s.fail_next = 0;
    }

    pub fn reject_publishes(&self, code: u8) {
        self.script.lock().reject_code = Some(code);
    }

    pub fn break_transport(&self, cause: &str) {
        self.script.lock().transport_error = Some(cause.to_string());
    }

    /// Dials still succeed but every subscribe is refused.
    pub fn fail_subscribes(&self, cause: &str) {
        self.script.lock().subscribe_error = Some(cause.to_string());
    }

    pub fn dial_count(&self) -> u32 {
        self.script.lock().dials
    }

    pub fn disconnect_count(&self) -> u32 {
        self.script.lock().disconnects
    }

    pub fn publishes(&self) -> Vec<(String, Vec<u8>)> {
        self.script.lock().publishes.clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.script.lock().subscriptions.clone()
    }

    /// Delivers a message as if the broker had pushed it on the live session.
    pub fn inject(&self, topic: &str, payload: &[u8]) {
        if let Some((_, tx)) = &self.script.lock().live {
            let _ = tx.send(LinkEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
        }
    }

    /// Kills the live session without the manager asking for it.
    pub fn drop_link(&self, reason: &str) {
        if let Some((generation, tx)) = self.script.lock().live.take() {
            let _ = tx.send(LinkEvent::Dropped {
                generation,
                reason: reason.to_string(),
            });
        }
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        generation: u64,
        inbound: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn Session>, ConnectError> {
        let mut s = self.script.lock();
        s.dials += 1;
        if let Some(cause) = s.failure.clone() {
            if s.fail_always {
                return Err(cause);
            }
            if s.fail_next > 0 {
                s.fail_next -= 1;
                return Err(cause);
            }
        }
        s.live = Some((generation, inbound.clone()));
        Ok(Box::new(MockSession {
            generation,
            inbound,
            script: Arc::clone(&self.script),
        }))
    }
}

pub struct MockSession {
    generation: u64,
    inbound: mpsc::UnboundedSender<LinkEvent>,
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl Session for MockSession {
    async fn subscribe(&self, pattern: &str) -> Result<(), PublishError> {
        let mut s = self.script.lock();
        if let Some(cause) = &s.subscribe_error {
            return Err(PublishError::Transport(cause.clone()));
        }
        s.subscriptions.push(pattern.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let mut s = self.script.lock();
        if let Some(cause) = &s.transport_error {
            return Err(PublishError::Transport(cause.clone()));
        }
        if let Some(code) = s.reject_code {
            return Err(PublishError::BrokerRejected(code));
        }
        s.publishes.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn disconnect(&self) {
        let mut s = self.script.lock();
        s.disconnects += 1;
        if s.live.as_ref().is_some_and(|(g, _)| *g == self.generation) {
            s.live = None;
        }
        // Trailing drop, like a real client closing its event loop.
        let _ = self.inbound.send(LinkEvent::Dropped {
            generation: self.generation,
            reason: "disconnected on request".to_string(),
        });
    }
}
