//! Protocol senders: the terminal pipeline stage.
//!
//! A sender owns its connection and is private to one worker. `send` never
//! fails loudly: any delivery problem is logged and reported as `false` so
//! the worker drops the event for this destination and carries on.
//!
//! | Destination | Sender |
//! |-------------|--------|
//! | `MQTT_TOPIC` | [`MqttSender`] (plain or TLS) |
//! | `IOTCORE_MQTT` | [`MqttSender`] with JWT-signed password |
//! | `AZURE_MQTT` | [`MqttSender`] with SAS credentials |
//! | `AWS_MQTT` | [`MqttSender`] with mutual TLS |
//! | `THINGSBOARD_MQTT` | [`MqttSender`] with device token |
//! | `REST_ENDPOINT` | [`RestSender`] |
//! | `XMPP_TOPIC` | [`XmppSender`] |

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::keys::{KeyDecrypter, KeyError};
use crate::models::{Destination, Event, Registration};

pub mod cloud;
pub mod mqtt;
pub mod rest;
pub mod xmpp;

pub use mqtt::{MqttConnection, MqttSender};
pub use rest::RestSender;
pub use xmpp::XmppSender;

/// Errors raised while constructing or connecting a sender.
#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    #[error("unsupported destination '{0}'")]
    Unsupported(String),

    #[error("invalid sink configuration: {0}")]
    Config(String),

    #[error("key material rejected: {0}")]
    Key(#[from] KeyError),

    #[error("JWT signing failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Delivers a formatted, transformed payload to one sink.
#[async_trait]
pub trait Sender: Send {
    /// Deliver `payload`. Returns `true` only when the sink accepted it.
    async fn send(&mut self, payload: &[u8], event: &Event) -> bool;

    /// Protocol label for logs.
    fn protocol(&self) -> &'static str;
}

/// Builds the sender for a registration's destination.
///
/// Construction validates configuration and credentials but does not
/// connect; connections are established on first send.
pub trait SenderFactory: Send + Sync {
    fn build(
        &self,
        registration: &Registration,
        keys: &dyn KeyDecrypter,
    ) -> Result<Box<dyn Sender>, SenderError>;
}

/// Timeouts shared by all senders.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SenderSettings {
    /// Time allowed for an MQTT CONNACK or XMPP handshake, in seconds.
    pub connect_timeout_secs: u64,
    /// MQTT keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Per-request timeout for REST sinks, in seconds.
    pub http_timeout_secs: u64,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 5,
            keep_alive_secs: 30,
            http_timeout_secs: 30,
        }
    }
}

impl SenderSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(5))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Resolves each [`Destination`] to its protocol sender.
#[derive(Debug, Clone, Default)]
pub struct DestinationSenders {
    settings: SenderSettings,
}

impl DestinationSenders {
    pub fn new(settings: SenderSettings) -> Self {
        Self { settings }
    }
}

impl SenderFactory for DestinationSenders {
    fn build(
        &self,
        registration: &Registration,
        keys: &dyn KeyDecrypter,
    ) -> Result<Box<dyn Sender>, SenderError> {
        let settings = &self.settings;
        let sender: Box<dyn Sender> = match &registration.destination {
            Destination::Mqtt => Box::new(MqttSender::topic(registration, keys, settings)?),
            Destination::IotCoreMqtt => Box::new(cloud::iot_core(registration, keys, settings)?),
            Destination::AzureMqtt => Box::new(cloud::azure(registration, settings)?),
            Destination::AwsMqtt => Box::new(cloud::aws(registration, keys, settings)?),
            Destination::ThingsBoardMqtt => {
                Box::new(cloud::thingsboard(registration, keys, settings)?)
            }
            Destination::Rest => Box::new(RestSender::new(registration, settings)?),
            Destination::Xmpp => Box::new(XmppSender::new(registration, settings)?),
            other @ (Destination::Zmq | Destination::InfluxDb) => {
                return Err(SenderError::Unsupported(other.to_string()))
            }
            Destination::Unsupported(value) => {
                return Err(SenderError::Unsupported(value.clone()))
            }
        };
        Ok(sender)
    }
}
