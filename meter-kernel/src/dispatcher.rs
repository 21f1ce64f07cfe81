use crate::broker::{ConnectionManager, PublishError};
use crate::models::{MeterId, PowerState};
use crate::topics::TopicCodec;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("broker unavailable")]
    BrokerUnavailable,
    #[error("broker rejected command (code {code})")]
    PublishRejected { code: u8 },
    #[error("transport error: {cause}")]
    TransportError { cause: String },
}

impl From<PublishError> for DispatchError {
    fn from(e: PublishError) -> Self {
        match e {
            // Lost the session between the check and the publish.
            PublishError::NotConnected => DispatchError::BrokerUnavailable,
            PublishError::BrokerRejected(code) => DispatchError::PublishRejected { code },
            PublishError::Transport(cause) => DispatchError::TransportError { cause },
        }
    }
}

/// What was handed to the broker. Says nothing about whether the device
/// acted on it; confirmation arrives later as a power echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandAck {
    pub topic: String,
    pub payload: String,
}

/// Power commands for the HTTP layer. At most once: a failed command is
/// reported, never queued for retry.
#[derive(Clone)]
pub struct CommandDispatcher {
    broker: Arc<ConnectionManager>,
    codec: TopicCodec,
}

impl CommandDispatcher {
    pub fn new(broker: Arc<ConnectionManager>, codec: TopicCodec) -> Self {
        Self { broker, codec }
    }

    pub async fn set_power(&self, mac: &MeterId, desired: PowerState) -> Result<CommandAck, DispatchError> {
        if !self.broker.ensure_connected().await {
            warn!("command {} for {mac} not sent, broker unavailable", desired.command_payload());
            return Err(DispatchError::BrokerUnavailable);
        }

        let topic = self.codec.command_topic(mac);
        let payload = desired.command_payload();
        self.broker.publish(&topic, payload.as_bytes()).await.map_err(|e| {
            warn!("publish {payload} to {topic} failed: {e}");
            DispatchError::from(e)
        })?;

        info!("sent {payload} to {topic}");
        Ok(CommandAck {
            topic,
            payload: payload.to_string(),
        })
    }

    pub async fn turn_on(&self, mac: &MeterId) -> Result<CommandAck, DispatchError> {
        self.set_power(mac, PowerState::On).await
    }

    pub async fn turn_off(&self, mac: &MeterId) -> Result<CommandAck, DispatchError> {
        self.set_power(mac, PowerState::Off).await
    }
}
