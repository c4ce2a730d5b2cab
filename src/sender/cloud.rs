//! Cloud IoT flavours of the MQTT sender.
//!
//! Each vendor wants a particular client id, credential scheme and topic
//! layout; all of it is derived from the registration's addressable.

use jsonwebtoken::EncodingKey;

use super::mqtt::{base_options, tls_transport, Credentials, MqttConnection, MqttSender};
use super::{SenderError, SenderSettings};
use crate::keys::KeyDecrypter;
use crate::models::Registration;

const IOT_CORE_HOST: &str = "mqtt.googleapis.com";
const AZURE_API_VERSION: &str = "2018-06-30";
const THINGSBOARD_TOPIC: &str = "v1/gateway/telemetry";
const TLS_PORT: u16 = 8883;
const PLAIN_PORT: u16 = 1883;

/// Parsed `projects/{p}/locations/{r}/registries/{g}/devices/{d}` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IotCorePath {
    pub project: String,
    pub region: String,
    pub registry: String,
    pub device: String,
}

impl IotCorePath {
    pub fn parse(path: &str) -> Result<Self, SenderError> {
        let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
        match parts.as_slice() {
            ["projects", project, "locations", region, "registries", registry, "devices", device]
                if [project, region, registry, device].iter().all(|s| !s.is_empty()) =>
            {
                Ok(Self {
                    project: project.to_string(),
                    region: region.to_string(),
                    registry: registry.to_string(),
                    device: device.to_string(),
                })
            }
            _ => Err(SenderError::Config(format!(
                "publisher '{}' is not a projects/../locations/../registries/../devices/.. path",
                path
            ))),
        }
    }
}

/// Google Cloud IoT Core: JWT password, device path client id.
pub fn iot_core(
    registration: &Registration,
    keys: &dyn KeyDecrypter,
    settings: &SenderSettings,
) -> Result<MqttSender, SenderError> {
    let mut addr = registration.addressable.clone();
    let path = IotCorePath::parse(&addr.publisher)?;
    if addr.address.is_empty() {
        addr.address = IOT_CORE_HOST.to_string();
    }

    let key_pem = keys.decrypt(&addr.private_key)?;
    let key = EncodingKey::from_rsa_pem(&key_pem)?;

    let mut options = base_options(&addr, &addr.publisher, TLS_PORT, settings)?;
    options.set_transport(tls_transport(&addr, keys, false)?);

    let credentials = Credentials::Jwt {
        user: "unused".to_string(),
        audience: path.project.clone(),
        key,
    };
    let topic = if addr.topic.is_empty() {
        format!("/devices/{}/events", path.device)
    } else {
        addr.topic.clone()
    };

    let connection = MqttConnection::new(options, credentials, settings.connect_timeout());
    Ok(MqttSender::new(connection, topic))
}

/// Azure IoT Hub: device id client, SAS token password.
pub fn azure(
    registration: &Registration,
    settings: &SenderSettings,
) -> Result<MqttSender, SenderError> {
    let addr = &registration.addressable;
    let device = addr.publisher.trim();
    if device.is_empty() {
        return Err(SenderError::Config(
            "Azure destination requires the device id in publisher".to_string(),
        ));
    }
    if addr.password.is_empty() {
        return Err(SenderError::Config(
            "Azure destination requires a SAS token password".to_string(),
        ));
    }

    let mut options = base_options(addr, device, TLS_PORT, settings)?;
    // CA only; Azure authenticates the device by SAS token.
    let mut server_only = addr.clone();
    server_only.certificate.clear();
    options.set_transport(tls_transport(&server_only, &NoKeys, false)?);

    let credentials = Credentials::Static {
        user: format!(
            "{}/{}/?api-version={}",
            addr.address, device, AZURE_API_VERSION
        ),
        password: addr.password.clone(),
    };
    let topic = format!("devices/{}/messages/events/", device);

    let connection = MqttConnection::new(options, credentials, settings.connect_timeout());
    Ok(MqttSender::new(connection, topic))
}

/// AWS IoT: mutual TLS, publishes to the thing's shadow by default.
pub fn aws(
    registration: &Registration,
    keys: &dyn KeyDecrypter,
    settings: &SenderSettings,
) -> Result<MqttSender, SenderError> {
    let addr = &registration.addressable;
    let thing = addr.publisher.trim();
    if thing.is_empty() {
        return Err(SenderError::Config(
            "AWS destination requires the thing name in publisher".to_string(),
        ));
    }

    let mut options = base_options(addr, thing, TLS_PORT, settings)?;
    options.set_transport(tls_transport(addr, keys, true)?);

    let topic = if addr.topic.is_empty() {
        format!("$aws/things/{}/shadow/update", thing)
    } else {
        addr.topic.clone()
    };

    let connection =
        MqttConnection::new(options, Credentials::Anonymous, settings.connect_timeout());
    Ok(MqttSender::new(connection, topic))
}

/// ThingsBoard gateway: device access token as username.
pub fn thingsboard(
    registration: &Registration,
    keys: &dyn KeyDecrypter,
    settings: &SenderSettings,
) -> Result<MqttSender, SenderError> {
    let addr = &registration.addressable;
    if addr.user.is_empty() {
        return Err(SenderError::Config(
            "ThingsBoard destination requires the device token in user".to_string(),
        ));
    }

    let default_port = if addr.is_tls() { TLS_PORT } else { PLAIN_PORT };
    let mut options = base_options(addr, &addr.publisher, default_port, settings)?;
    if addr.is_tls() {
        options.set_transport(tls_transport(addr, keys, false)?);
    }

    let credentials = Credentials::Static {
        user: addr.user.clone(),
        password: String::new(),
    };
    let topic = if addr.topic.is_empty() {
        THINGSBOARD_TOPIC.to_string()
    } else {
        addr.topic.clone()
    };

    let connection = MqttConnection::new(options, credentials, settings.connect_timeout());
    Ok(MqttSender::new(connection, topic))
}

/// Decrypter for server-only TLS, where no key is ever requested.
struct NoKeys;

impl KeyDecrypter for NoKeys {
    fn decrypt(&self, _ciphertext: &str) -> Result<Vec<u8>, crate::keys::KeyError> {
        Err(crate::keys::KeyError::Empty)
    }
}
