use crate::models::{MeterId, PowerState};
use crate::store::UnnamedMeter;
use crate::topics::Payload;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::trace;

/// Room for a burst of events before a slow subscriber starts losing them.
pub const FANOUT_CAPACITY: usize = 256;

/// Events pushed to real-time UI subscribers.
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum BridgeEvent {
    PowerStatusUpdate {
        mac: MeterId,
        status: PowerState,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    MqttMessage {
        topic: String,
        payload: Payload,
    },
    MeterUpdated {
        mac: MeterId,
        name: String,
        /// Always rendered with three digits (`007`).
        number: String,
    },
    NewUnnamedMeters {
        count: usize,
        meters: Vec<UnnamedMeter>,
    },
}

impl BridgeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BridgeEvent::PowerStatusUpdate { .. } => "power_status_update",
            BridgeEvent::MqttMessage { .. } => "mqtt_message",
            BridgeEvent::MeterUpdated { .. } => "meter_updated",
            BridgeEvent::NewUnnamedMeters { .. } => "new_unnamed_meters",
        }
    }

    pub fn meter_updated(mac: MeterId, name: impl Into<String>, number: u16) -> Self {
        BridgeEvent::MeterUpdated {
            mac,
            name: name.into(),
            number: format!("{number:03}"),
        }
    }
}

/// Best-effort broadcast: subscribers that are gone or too slow miss events.
#[derive(Clone)]
pub struct FanOut {
    tx: broadcast::Sender<BridgeEvent>,
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new(FANOUT_CAPACITY)
    }
}

impl FanOut {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: BridgeEvent) {
        let name = event.name();
        // Err only means nobody is listening right now.
        match self.tx.send(event) {
            Ok(n) => trace!("{name} delivered to {n} subscribers"),
            Err(_) => trace!("{name} dropped, no subscribers"),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
