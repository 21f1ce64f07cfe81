//! Pretends to be one or more meters on the broker: answers power commands
//! with the matching echo and can publish periodic energy data.
//!
//! `SIM_METERS` lists the meter ids (comma separated), `SIM_DATA_INTERVAL_SECS`
//! turns on data messages. Broker settings come from the bridge config.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use meter_kernel::config::load_config;
use meter_kernel::models::{MeterId, PowerState};
use meter_kernel::topics::{TopicCodec, COMMAND_ROOT, POWER_LEAF};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::collections::BTreeMap;
use tokio::time::{sleep, Duration};

const DEFAULT_METERS: &str = "08:84:dd:9f";

#[derive(Debug, Clone, PartialEq)]
struct SimMeter {
    power: PowerState,
    total_kwh: f64,
}

struct Fleet {
    codec: TopicCodec,
    meters: BTreeMap<MeterId, SimMeter>,
}

impl Fleet {
    fn new(codec: TopicCodec, ids: Vec<MeterId>) -> Self {
        let meters = ids
            .into_iter()
            .map(|id| {
                let meter = SimMeter {
                    power: PowerState::Off,
                    total_kwh: 0.0,
                };
                (id, meter)
            })
            .collect();
        Self { codec, meters }
    }

    /// Applies a command and returns the echo to publish, if the command is
    /// for one of ours.
    fn on_command(&mut self, topic: &str, payload: &[u8]) -> Option<(String, &'static str)> {
        let id = self.codec.decode_command_topic(topic)?;
        let meter = self.meters.get_mut(&id)?;
        let text = String::from_utf8_lossy(payload);
        meter.power = match text.trim() {
            "ON" => PowerState::On,
            "OFF" => PowerState::Off,
            other => {
                warn!("ignoring unknown command {other:?} for {id}");
                return None;
            }
        };
        Some((self.codec.power_echo_topic(&id), meter.power.command_payload()))
    }

    /// Advances every switched-on meter and returns its data message.
    fn tick(&mut self, step_kwh: f64) -> Vec<(String, String)> {
        self.meters
            .iter_mut()
            .map(|(id, meter)| {
                if meter.power == PowerState::On {
                    meter.total_kwh += step_kwh;
                }
                let body = serde_json::json!({
                    "mac": id,
                    "total_kwh": meter.total_kwh,
                    "power": meter.power.command_payload(),
                });
                (self.codec.data_topic(id), body.to_string())
            })
            .collect()
    }
}

fn parse_meters(raw: &str) -> Result<Vec<MeterId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| MeterId::parse(s).with_context(|| format!("bad meter id {s:?}")))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cfg = load_config().await?;
    let ids = parse_meters(&std::env::var("SIM_METERS").unwrap_or_else(|_| DEFAULT_METERS.into()))?;
    let interval = std::env::var("SIM_DATA_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0);

    let mut fleet = Fleet::new(cfg.mqtt.codec(), ids);
    info!("simulating {} meters against {}:{}", fleet.meters.len(), cfg.mqtt.host, cfg.mqtt.port);

    let mut opts = MqttOptions::new(format!("meter-sim-{}", std::process::id()), &cfg.mqtt.host, cfg.mqtt.port);
    opts.set_keep_alive(Duration::from_secs(30));
    if let Some(user) = &cfg.mqtt.user {
        opts.set_credentials(user, cfg.mqtt.password.clone().unwrap_or_default());
    }
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    let mut ticker = tokio::time::interval(Duration::from_secs(interval.unwrap_or(3600)));

    loop {
        tokio::select! {
            _ = ticker.tick(), if interval.is_some() => {
                for (topic, body) in fleet.tick(0.01) {
                    if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, body).await {
                        error!("data publish failed: {e}");
                    }
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    // Re-subscribe after every (re)connect.
                    let pattern = format!("{COMMAND_ROOT}/+/{POWER_LEAF}");
                    client.subscribe(&pattern, QoS::AtLeastOnce).await?;
                    info!("connected, listening on {pattern}");
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    debug!("command on {}", p.topic);
                    if let Some((topic, payload)) = fleet.on_command(&p.topic, &p.payload) {
                        info!("{} -> {payload}", p.topic);
                        if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                            error!("echo publish failed: {e}");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {e}. Reconnecting...");
                    sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}
