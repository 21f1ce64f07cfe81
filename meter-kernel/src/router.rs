use crate::fanout::{BridgeEvent, FanOut};
use crate::models::{MeterId, PowerState};
use crate::state::{new_state, PowerMap, Shared};
use crate::store::FleetLedger;
use crate::topics::{decode_payload, TopicCodec, TopicVariant};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Counters {
    routed: AtomicU64,
    power_echoes: AtomicU64,
    relayed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub messages_routed: u64,
    pub power_echoes: u64,
    pub generic_relays: u64,
}

struct StatusWrite {
    mac: MeterId,
    status: PowerState,
    at: OffsetDateTime,
}

/// Records status events one at a time, in the order they were queued, on
/// the blocking pool.
fn spawn_status_writer(ledger: Arc<dyn FleetLedger>) -> mpsc::UnboundedSender<StatusWrite> {
    let (tx, mut rx) = mpsc::unbounded_channel::<StatusWrite>();
    tokio::spawn(async move {
        while let Some(write) = rx.recv().await {
            let ledger = Arc::clone(&ledger);
            let res = tokio::task::spawn_blocking(move || {
                ledger
                    .record_status_event(&write.mac, write.status, write.at)
                    .map_err(|e| format!("could not record status {} for {}: {e}", write.status, write.mac))
            })
            .await;
            match res {
                Ok(Ok(())) => {}
                Ok(Err(msg)) => warn!("{msg}"),
                Err(e) => warn!("status writer task failed: {e}"),
            }
        }
        debug!("status writer stopped");
    });
    tx
}

/// Turns inbound broker traffic into fan-out events.
///
/// Only the connection manager's pump calls [`EventRouter::on_message`], one
/// message at a time in arrival order. Store writes are queued to a
/// background writer so a slow store never holds up delivery.
pub struct EventRouter {
    codec: TopicCodec,
    fanout: FanOut,
    writes: mpsc::UnboundedSender<StatusWrite>,
    power: Shared<PowerMap>,
    counters: Counters,
}

impl EventRouter {
    /// Must be called inside a tokio runtime; it spawns the status writer.
    pub fn new(codec: TopicCodec, fanout: FanOut, ledger: Arc<dyn FleetLedger>) -> Self {
        Self {
            codec,
            fanout,
            writes: spawn_status_writer(ledger),
            power: new_state(PowerMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn on_message(&self, topic: &str, raw: &[u8]) {
        self.counters.routed.fetch_add(1, Ordering::Relaxed);

        if let Some(decoded) = self.codec.decode_status_topic(topic) {
            if decoded.variant == TopicVariant::PowerEcho {
                let text = String::from_utf8_lossy(raw);
                self.on_power_echo(decoded.id, PowerState::from_echo(&text));
                return;
            }
        }

        let payload = decode_payload(raw);
        if !payload.is_structured() {
            debug!("payload on {topic} is not JSON, relaying as text");
        }
        self.counters.relayed.fetch_add(1, Ordering::Relaxed);
        self.fanout.emit(BridgeEvent::MqttMessage {
            topic: topic.to_string(),
            payload,
        });
    }

    fn on_power_echo(&self, mac: MeterId, status: PowerState) {
        let now = OffsetDateTime::now_utc();
        self.counters.power_echoes.fetch_add(1, Ordering::Relaxed);
        self.power.lock().insert(mac.clone(), status);

        let write = StatusWrite {
            mac: mac.clone(),
            status,
            at: now,
        };
        if self.writes.send(write).is_err() {
            warn!("status writer gone, {status} for {mac} not recorded");
        }

        debug!("power echo {mac} -> {status}");
        self.fanout.emit(BridgeEvent::PowerStatusUpdate {
            mac,
            status,
            timestamp: now,
        });
    }

    /// Last power state echoed by a meter since startup.
    pub fn last_known_power(&self, mac: &MeterId) -> Option<PowerState> {
        self.power.lock().get(mac).copied()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            messages_routed: self.counters.routed.load(Ordering::Relaxed),
            power_echoes: self.counters.power_echoes.load(Ordering::Relaxed),
            generic_relays: self.counters.relayed.load(Ordering::Relaxed),
        }
    }
}
