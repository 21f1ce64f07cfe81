use super::{ConnectError, Dialer, LinkEvent, PublishError, Session};
use crate::config::MqttConf;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Dials the configured broker with rumqttc.
pub struct RumqttDialer {
    conf: MqttConf,
}

impl RumqttDialer {
    pub fn new(conf: MqttConf) -> Self {
        Self { conf }
    }
}

fn refused(code: ConnectReturnCode) -> ConnectError {
    match code {
        ConnectReturnCode::RefusedProtocolVersion => ConnectError::BadProtocol,
        ConnectReturnCode::BadClientId => ConnectError::BadClientId,
        ConnectReturnCode::BadUserNamePassword => ConnectError::BadCredentials,
        ConnectReturnCode::NotAuthorized => ConnectError::Unauthorized,
        other => ConnectError::BrokerUnreachable(format!("connection refused: {other:?}")),
    }
}

fn connection_error(e: ConnectionError) -> ConnectError {
    match e {
        ConnectionError::ConnectionRefused(code) => refused(code),
        other => ConnectError::BrokerUnreachable(other.to_string()),
    }
}

/// Fresh id per dial so a lingering old session never kicks the new one.
/// The generation keeps two dials within the same second apart.
fn session_client_id(base: &str, generation: u64, now: OffsetDateTime) -> String {
    format!("{base}_{}_{generation}", now.unix_timestamp())
}

#[async_trait]
impl Dialer for RumqttDialer {
    async fn dial(
        &self,
        generation: u64,
        inbound: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn Session>, ConnectError> {
        let client_id = session_client_id(&self.conf.client_id, generation, OffsetDateTime::now_utc());
        let mut opts = MqttOptions::new(&client_id, &self.conf.host, self.conf.port);
        opts.set_keep_alive(Duration::from_secs(self.conf.keep_alive_secs));
        opts.set_clean_session(true);
        if let Some(user) = &self.conf.user {
            opts.set_credentials(user, self.conf.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 10);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return match ack.code {
                            ConnectReturnCode::Success => Ok(()),
                            code => Err(refused(code)),
                        };
                    }
                    Ok(_) => {}
                    Err(e) => return Err(connection_error(e)),
                }
            }
        };

        let timeout = Duration::from_secs(self.conf.connect_timeout_secs);
        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ConnectError::BrokerUnreachable(format!(
                    "no CONNACK from {}:{} within {}s",
                    self.conf.host, self.conf.port, self.conf.connect_timeout_secs
                )))
            }
        }
        info!("MQTT session {client_id} established with {}:{}", self.conf.host, self.conf.port);

        // Receive loop. It stops at the first error instead of letting rumqttc
        // reconnect on its own; the manager decides what happens next.
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let event = LinkEvent::Message {
                            topic: p.topic.clone(),
                            payload: p.payload.to_vec(),
                        };
                        if inbound.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        let _ = inbound.send(LinkEvent::Dropped {
                            generation,
                            reason: "broker sent DISCONNECT".to_string(),
                        });
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = inbound.send(LinkEvent::Dropped {
                            generation,
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
            }
            debug!("receive loop of session {generation} finished");
        });

        Ok(Box::new(RumqttSession { client }))
    }
}

pub struct RumqttSession {
    client: AsyncClient,
}

#[async_trait]
impl Session for RumqttSession {
    async fn subscribe(&self, pattern: &str) -> Result<(), PublishError> {
        self.client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }

    // rumqttc only queues the packet here; broker-side rejection is not
    // observable at this point.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("disconnect on closed session: {e}");
        }
    }
}
