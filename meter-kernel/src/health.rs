use crate::broker::{ConnectionManager, ConnectionState};
use crate::router::EventRouter;
use crate::store::MeterStore;
use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct BridgeHealth {
    pub status: &'static str,
    pub db_connected: bool,
    pub mqtt_connected: bool,
    pub mqtt_state: ConnectionState,
    pub mqtt_reconnects: u32,
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub messages_routed: u64,
    pub power_echoes: u64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    pub fn get_health(
        &self,
        store: &dyn MeterStore,
        broker: &ConnectionManager,
        router: &EventRouter,
    ) -> BridgeHealth {
        let db_connected = store.ping();
        let mqtt_state = broker.state();
        let stats = router.stats();

        BridgeHealth {
            status: if db_connected { "ok" } else { "degraded" },
            db_connected,
            mqtt_connected: mqtt_state == ConnectionState::Connected,
            mqtt_state,
            mqtt_reconnects: broker.reconnect_count(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            messages_routed: stats.messages_routed,
            power_echoes: stats.power_echoes,
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            if let Some(kb) = parse_vm_rss_kb(&status) {
                return kb as f32 / 1024.0;
            }
        }
    }

    // rough figure off Linux
    12.0
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}
