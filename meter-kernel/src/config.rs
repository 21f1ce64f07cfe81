use crate::broker::RetryPolicy;
use crate::topics::{TopicCodec, DEFAULT_DEVICE_PREFIX, DEFAULT_DOMAIN};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "METER_BRIDGE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "bridge.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid value for {var}: {value:?}")]
    BadEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub mqtt: MqttConf,
    pub reconnect: ReconnectConf,
    pub http: HttpConf,
    pub store: StoreConf,
    pub fleet: FleetConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub domain: String,
    pub device_prefix: String,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            user: None,
            password: None,
            client_id: "maaler_web_interface".into(),
            keep_alive_secs: 60,
            connect_timeout_secs: 5,
            domain: DEFAULT_DOMAIN.into(),
            device_prefix: DEFAULT_DEVICE_PREFIX.into(),
        }
    }
}

impl MqttConf {
    pub fn codec(&self) -> TopicCodec {
        TopicCodec::new(&self.domain, &self.device_prefix)
    }

    /// First two characters only, for logs.
    pub fn masked_password(&self) -> String {
        match &self.password {
            Some(p) if !p.is_empty() => format!("{}***", p.chars().take(2).collect::<String>()),
            _ => "<none>".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConf {
    pub retries: u32,
    pub delay_ms: u64,
}

impl Default for ReconnectConf {
    fn default() -> Self {
        Self {
            retries: 5,
            delay_ms: 1000,
        }
    }
}

impl ReconnectConf {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            delay: std::time::Duration::from_millis(self.delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    pub port: u16,
    pub api_key: Option<String>,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            port: 5000,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConf {
    pub path: String,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self {
            path: "./data/meters.json".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConf {
    pub freshness_minutes: i64,
    pub delete_code: String,
}

impl Default for FleetConf {
    fn default() -> Self {
        Self {
            freshness_minutes: 30,
            delete_code: "2012".into(),
        }
    }
}

impl FleetConf {
    pub fn freshness(&self) -> time::Duration {
        time::Duration::minutes(self.freshness_minutes)
    }
}

pub fn parse_config(txt: &str) -> Result<BridgeConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(BridgeConfig::default());
    }
    Ok(serde_yaml::from_str(txt)?)
}

pub async fn read_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&txt)
}

/// Applies the environment on top of the file values.
pub fn apply_env<F>(cfg: &mut BridgeConfig, get: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = get("MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = get("MQTT_PORT") {
        cfg.mqtt.port = port.parse().map_err(|_| ConfigError::BadEnv {
            var: "MQTT_PORT",
            value: port,
        })?;
    }
    if let Some(user) = get("MQTT_USER").filter(|u| !u.is_empty()) {
        cfg.mqtt.user = Some(user);
    }
    if let Some(password) = get("MQTT_PASSWORD").filter(|p| !p.is_empty()) {
        cfg.mqtt.password = Some(password);
    }
    if let Some(port) = get("BACKEND_PORT") {
        cfg.http.port = port.parse().map_err(|_| ConfigError::BadEnv {
            var: "BACKEND_PORT",
            value: port,
        })?;
    }
    if let Some(key) = get("METER_API_KEY").filter(|k| !k.is_empty()) {
        cfg.http.api_key = Some(key);
    }
    if let Some(path) = get("METER_STORE_PATH") {
        cfg.store.path = path;
    }
    Ok(())
}

/// File named by `METER_BRIDGE_CONFIG` (or `bridge.yaml`), then the
/// environment. A missing or broken file falls back to defaults.
pub async fn load_config() -> Result<BridgeConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut cfg = if Path::new(&path).exists() {
        match read_config(Path::new(&path)).await {
            Ok(cfg) => {
                info!("loaded config from {path}");
                cfg
            }
            Err(e) => {
                warn!("{e}, using defaults");
                BridgeConfig::default()
            }
        }
    } else {
        info!("no {path}, using default config");
        BridgeConfig::default()
    };

    apply_env(&mut cfg, |var| std::env::var(var).ok())?;
    Ok(cfg)
}
