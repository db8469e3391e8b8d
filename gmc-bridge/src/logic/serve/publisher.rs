use crate::logic::config::BridgeConfig;
use crate::logic::serve::error::{BridgeError, PublishError};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    Transport,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const CLIENT_ID: &str = "gqgmc-mqtt-bridge-publisher";

/// Upper bound on waiting for a single publish
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_LOOP_CAPACITY: usize = 100;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Publish-only view of the broker
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str, retained: bool)
        -> Result<(), PublishError>;
}

/// QoS 0 publisher backed by a rumqttc client
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    timeout: Duration,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &str,
        retained: bool,
    ) -> Result<(), PublishError> {
        let request = self
            .client
            .publish(topic, QoS::AtMostOnce, retained, payload.as_bytes().to_vec());
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(PublishError::from),
            Err(_) => Err(PublishError::Timeout(self.timeout)),
        }
    }
}

/// Handle on the background event loop, kept alive for the process lifetime
pub struct MqttConnection {
    client: AsyncClient,
    event_loop_handle: JoinHandle<()>,
}

impl MqttConnection {
    /// Send DISCONNECT and give the event loop a moment to flush it
    pub async fn shutdown(self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "Failed to disconnect MQTT client");
        }
        let abort = self.event_loop_handle.abort_handle();
        if tokio::time::timeout(DISCONNECT_GRACE, self.event_loop_handle)
            .await
            .is_err()
        {
            warn!("MQTT event loop did not stop in time, aborting");
            abort.abort();
        }
    }
}

/// Connect to the configured broker and wait for its CONNACK.
///
/// Any failure here is fatal for the bridge; reconnects after startup are
/// handled by the background event loop.
pub async fn connect(
    config: &BridgeConfig,
) -> anyhow::Result<(MqttPublisher, MqttConnection)> {
    let address = config.broker_address()?;
    let mut options = MqttOptions::new(CLIENT_ID, address.host.clone(), address.port);
    options.set_keep_alive(KEEP_ALIVE);
    if let Some((username, password)) = config.credentials() {
        options.set_credentials(username, password);
    }
    if address.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    let (client, event_loop) = AsyncClient::new(options, EVENT_LOOP_CAPACITY);
    let event_loop = tokio::time::timeout(CONNECT_TIMEOUT, establish_connection(event_loop))
        .await
        .map_err(|_| BridgeError::ConnectTimeout(CONNECT_TIMEOUT))??;
    info!(
        host = %address.host,
        port = address.port,
        tls = address.tls,
        "mqtt connected successfully"
    );

    let event_loop_handle = tokio::spawn(run(event_loop));
    let publisher = MqttPublisher {
        client: client.clone(),
        timeout: PUBLISH_TIMEOUT,
    };
    Ok((
        publisher,
        MqttConnection {
            client,
            event_loop_handle,
        },
    ))
}

async fn establish_connection(mut event_loop: EventLoop) -> Result<EventLoop, BridgeError> {
    loop {
        match event_loop.poll().await? {
            Event::Incoming(Packet::ConnAck(ConnAck { code, .. })) => {
                if code == ConnectReturnCode::Success {
                    return Ok(event_loop);
                }
                return Err(BridgeError::Refused(code));
            }
            notification => {
                debug!(notification = ?notification, "Bootstrap phase notification");
            }
        }
    }
}

/// Drive the event loop until a DISCONNECT goes either way
async fn run(mut event_loop: EventLoop) {
    let mut retry_delay = INITIAL_RETRY_DELAY;
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("Received MQTT Disconnect packet from server");
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Sent MQTT Disconnect packet to server");
                break;
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(code = ?ack.code, "mqtt reconnected");
                retry_delay = INITIAL_RETRY_DELAY;
            }
            Ok(_) => {
                retry_delay = INITIAL_RETRY_DELAY;
            }
            Err(err) => {
                error!(error = %err, retry_in = ?retry_delay, "MQTT event loop error");
                tokio::time::sleep(retry_delay).await;
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
            }
        }
    }
}
