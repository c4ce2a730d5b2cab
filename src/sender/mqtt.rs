//! MQTT sender and connection management.
//!
//! Connections are lazy. The first send (or the first send after the
//! connection drops) spawns a task that drives the MQTT event loop and
//! reports connection state over a watch channel. A failed connect is
//! retried once; after that the send reports failure.
//!
//! A publish counts as delivered only once the broker's PUBACK for its packet
//! id arrives within the connect timeout.

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event as MqttEvent, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Sender, SenderError, SenderSettings};
use crate::keys::KeyDecrypter;
use crate::models::{Addressable, Event, Registration};

/// Request queue depth between the client handle and its event loop.
const REQUEST_CAPACITY: usize = 16;

/// Lifetime of IoT Core connection tokens.
const JWT_LIFETIME_SECS: i64 = 3600;

/// How the connection authenticates.
#[derive(Clone)]
pub enum Credentials {
    Anonymous,
    /// Username and password sent as-is.
    Static { user: String, password: String },
    /// Fresh RS256 JWT minted for every connect, audience = project.
    Jwt {
        user: String,
        audience: String,
        key: EncodingKey,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Static { user, .. } => {
                f.debug_struct("Static").field("user", user).finish_non_exhaustive()
            }
            Credentials::Jwt { audience, .. } => f
                .debug_struct("Jwt")
                .field("audience", audience)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Serialize)]
struct JwtClaims {
    iat: i64,
    exp: i64,
    aud: String,
}

impl Credentials {
    fn resolve(&self) -> Result<Option<(String, String)>, SenderError> {
        match self {
            Credentials::Anonymous => Ok(None),
            Credentials::Static { user, password } => Ok(Some((user.clone(), password.clone()))),
            Credentials::Jwt {
                user,
                audience,
                key,
            } => {
                let iat = chrono::Utc::now().timestamp();
                let claims = JwtClaims {
                    iat,
                    exp: iat + JWT_LIFETIME_SECS,
                    aud: audience.clone(),
                };
                let token = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, key)?;
                Ok(Some((user.clone(), token)))
            }
        }
    }
}

/// Publish progress reported by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishNotice {
    /// Written to the socket under this packet id.
    Sent(u16),
    /// Broker acknowledged this packet id.
    Acked(u16),
}

/// Wait for the next publish to be written and then acknowledged.
///
/// Returns `false` if the event loop ends first.
async fn wait_for_puback(notices: &mut mpsc::UnboundedReceiver<PublishNotice>) -> bool {
    let mut pending = None;
    while let Some(notice) = notices.recv().await {
        match (notice, pending) {
            (PublishNotice::Sent(pkid), None) => pending = Some(pkid),
            (PublishNotice::Acked(pkid), Some(sent)) if pkid == sent => return true,
            _ => {}
        }
    }
    false
}

/// A lazily established MQTT connection with its event-loop task.
pub struct MqttConnection {
    options: MqttOptions,
    credentials: Credentials,
    connect_timeout: Duration,
    client: Option<AsyncClient>,
    connected: Option<watch::Receiver<bool>>,
    notices: Option<mpsc::UnboundedReceiver<PublishNotice>>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttConnection {
    pub fn new(options: MqttOptions, credentials: Credentials, connect_timeout: Duration) -> Self {
        Self {
            options,
            credentials,
            connect_timeout,
            client: None,
            connected: None,
            notices: None,
            event_loop: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        let running = self
            .event_loop
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        running && self.connected.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Connect, retrying once before giving up.
    pub async fn ensure_connected(&mut self) -> Result<(), SenderError> {
        if self.is_connected() {
            return Ok(());
        }
        match self.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(broker = %self.broker(), error = %e, "MQTT connect failed, retrying once");
                self.connect().await
            }
        }
    }

    async fn connect(&mut self) -> Result<(), SenderError> {
        self.disconnect();

        let mut options = self.options.clone();
        if let Some((user, password)) = self.credentials.resolve()? {
            options.set_credentials(user, password);
        }

        let broker = self.broker();
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (state_tx, mut state_rx) = watch::channel(false);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let loop_broker = broker.clone();
        let handle = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(MqttEvent::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            info!(broker = %loop_broker, "MQTT connected");
                            let _ = state_tx.send(true);
                        } else {
                            warn!(broker = %loop_broker, code = ?ack.code, "MQTT connection refused");
                            let _ = state_tx.send(false);
                            break;
                        }
                    }
                    Ok(MqttEvent::Outgoing(Outgoing::Publish(pkid))) => {
                        let _ = notice_tx.send(PublishNotice::Sent(pkid));
                    }
                    Ok(MqttEvent::Incoming(Packet::PubAck(ack))) => {
                        let _ = notice_tx.send(PublishNotice::Acked(ack.pkid));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(broker = %loop_broker, error = %e, "MQTT connection lost");
                        let _ = state_tx.send(false);
                        break;
                    }
                }
            }
        });

        let ready = tokio::time::timeout(self.connect_timeout, state_rx.wait_for(|up| *up))
            .await
            .map(|state| state.is_ok())
            .unwrap_or(false);

        self.client = Some(client);
        self.connected = Some(state_rx);
        self.notices = Some(notice_rx);
        self.event_loop = Some(handle);

        if ready {
            Ok(())
        } else {
            self.disconnect();
            Err(SenderError::Connection(format!(
                "no CONNACK from {} within {:?}",
                broker, self.connect_timeout
            )))
        }
    }

    fn disconnect(&mut self) {
        if let Some(handle) = self.event_loop.take() {
            handle.abort();
        }
        self.client = None;
        self.connected = None;
        self.notices = None;
    }

    /// Publish with QoS 1 and wait for the broker's PUBACK.
    ///
    /// Returns `false` if the broker is unreachable, drops the connection or
    /// does not acknowledge within the connect timeout.
    pub async fn publish(&mut self, topic: &str, payload: &[u8]) -> bool {
        if let Err(e) = self.ensure_connected().await {
            warn!(broker = %self.broker(), error = %e, "MQTT sender not connected");
            return false;
        }
        let (Some(client), Some(notices)) = (self.client.as_ref(), self.notices.as_mut()) else {
            return false;
        };

        // Notices left over from an earlier publish that timed out.
        while notices.try_recv().is_ok() {}

        let published = client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await;
        if let Err(e) = published {
            warn!(broker = %self.broker(), topic = %topic, error = %e, "MQTT publish failed");
            self.disconnect();
            return false;
        }

        let acked = tokio::time::timeout(self.connect_timeout, wait_for_puback(notices)).await;
        match acked {
            Ok(true) => true,
            Ok(false) => {
                warn!(broker = %self.broker(), topic = %topic, "MQTT connection lost before PUBACK");
                self.disconnect();
                false
            }
            Err(_) => {
                warn!(
                    broker = %self.broker(),
                    topic = %topic,
                    timeout = ?self.connect_timeout,
                    "No PUBACK from MQTT broker"
                );
                self.disconnect();
                false
            }
        }
    }

    fn broker(&self) -> String {
        let (host, port) = self.options.broker_address();
        format!("{}:{}", host, port)
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Publishes every payload to a fixed topic.
pub struct MqttSender {
    connection: MqttConnection,
    topic: String,
}

impl MqttSender {
    pub fn new(connection: MqttConnection, topic: impl Into<String>) -> Self {
        Self {
            connection,
            topic: topic.into(),
        }
    }

    /// Generic broker publish (`MQTT_TOPIC`).
    pub fn topic(
        registration: &Registration,
        keys: &dyn KeyDecrypter,
        settings: &SenderSettings,
    ) -> Result<Self, SenderError> {
        let addr = &registration.addressable;
        if addr.topic.is_empty() {
            return Err(SenderError::Config("MQTT topic is empty".to_string()));
        }

        let mut options = base_options(addr, &addr.publisher, 1883, settings)?;
        if addr.is_tls() {
            options.set_transport(tls_transport(addr, keys, false)?);
        }

        let credentials = if addr.user.is_empty() {
            Credentials::Anonymous
        } else {
            Credentials::Static {
                user: addr.user.clone(),
                password: addr.password.clone(),
            }
        };

        let connection = MqttConnection::new(options, credentials, settings.connect_timeout());
        Ok(Self::new(connection, addr.topic.clone()))
    }
}

#[async_trait]
impl Sender for MqttSender {
    async fn send(&mut self, payload: &[u8], event: &Event) -> bool {
        let delivered = self.connection.publish(&self.topic, payload).await;
        if delivered {
            debug!(topic = %self.topic, event_id = %event.id, "Published event to MQTT");
        }
        delivered
    }

    fn protocol(&self) -> &'static str {
        "mqtt"
    }
}

/// Options shared by every MQTT-family sender.
///
/// An empty client id gets a generated one; `default_port` applies when the
/// addressable leaves the port unset.
pub(crate) fn base_options(
    addr: &Addressable,
    client_id: &str,
    default_port: u16,
    settings: &SenderSettings,
) -> Result<MqttOptions, SenderError> {
    if addr.address.is_empty() {
        return Err(SenderError::Config("broker address is empty".to_string()));
    }

    let client_id = client_id.trim();
    let client_id = if client_id.is_empty() {
        format!("export-distro-{}", uuid::Uuid::new_v4().simple())
    } else {
        client_id.to_string()
    };
    let port = if addr.port == 0 {
        default_port
    } else {
        addr.port
    };

    let mut options = MqttOptions::new(client_id, addr.address.clone(), port);
    options.set_keep_alive(settings.keep_alive());
    options.set_clean_session(true);
    Ok(options)
}

/// TLS transport from the addressable's PEM material.
///
/// The private key is decrypted here, once per build. With `require_client_auth`
/// a missing client certificate rejects the configuration.
pub(crate) fn tls_transport(
    addr: &Addressable,
    keys: &dyn KeyDecrypter,
    require_client_auth: bool,
) -> Result<Transport, SenderError> {
    if addr.ca_certificate.is_empty() {
        return Err(SenderError::Config(
            "TLS destination requires caCertificate".to_string(),
        ));
    }

    let client_auth = if addr.certificate.is_empty() {
        if require_client_auth {
            return Err(SenderError::Config(
                "destination requires a client certificate".to_string(),
            ));
        }
        None
    } else {
        let key = keys.decrypt(&addr.private_key)?;
        Some((addr.certificate.as_bytes().to_vec(), key))
    };

    Ok(Transport::tls_with_config(TlsConfiguration::Simple {
        ca: addr.ca_certificate.as_bytes().to_vec(),
        alpn: None,
        client_auth,
    }))
}
