//! Export registrations: the persisted description of one delivery pipeline.
//!
//! Enum fields keep any string they were given. Values this service does not
//! understand decode into an `Unsupported` variant so that the worker build,
//! not the JSON decoder, rejects the registration and can log its name. A
//! blank compression or encryption algorithm means the stage is off.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Declares a string-backed enum with an `Unsupported(String)` fallback.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)? }
        default $default:ident $(, blank => $blank:ident)?
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
            /// A value this service does not implement.
            Unsupported(String),
        }

        impl $name {
            /// Wire representation.
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $wire,)+
                    Self::Unsupported(s) => s.as_str(),
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                let wire = s.trim().to_ascii_uppercase();
                $(
                    if wire.is_empty() {
                        return Self::$blank;
                    }
                )?
                match wire.as_str() {
                    $($wire => Self::$variant,)+
                    _ => Self::Unsupported(s),
                }
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::from(s.to_string())
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> Self {
                v.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum! {
    /// Payload convention used by the formatter stage.
    ExportFormat {
        Json => "JSON",
        Xml => "XML",
        IotCoreJson => "IOTCORE_JSON",
        AzureJson => "AZURE_JSON",
        AwsJson => "AWS_JSON",
        ThingsBoardJson => "THINGSBOARD_JSON",
        /// Forward the bus payload untouched.
        Noop => "NOOP",
    }
    default Json
}

wire_enum! {
    /// Optional compression applied after formatting.
    CompressionType {
        None => "NONE",
        Gzip => "GZIP",
        /// zlib stream.
        Zip => "ZIP",
    }
    default None, blank => None
}

wire_enum! {
    /// Sink protocol.
    Destination {
        Mqtt => "MQTT_TOPIC",
        IotCoreMqtt => "IOTCORE_MQTT",
        AzureMqtt => "AZURE_MQTT",
        AwsMqtt => "AWS_MQTT",
        ThingsBoardMqtt => "THINGSBOARD_MQTT",
        Rest => "REST_ENDPOINT",
        Xmpp => "XMPP_TOPIC",
        /// Recognised legacy value, no sender available.
        Zmq => "ZMQ_TOPIC",
        /// Recognised legacy value, no sender available.
        InfluxDb => "INFLUXDB",
    }
    default Rest
}

wire_enum! {
    /// Optional encryption applied after compression.
    EncryptionAlgorithm {
        None => "NONE",
        Aes => "AES",
    }
    default None, blank => None
}

/// Network location and credentials of a sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Addressable {
    pub name: String,
    /// `tcp`, `ssl`/`tls`, `http` or `https`.
    pub protocol: String,
    /// HTTP method for REST sinks.
    pub method: String,
    pub address: String,
    pub port: u16,
    pub path: String,
    /// Client identity: MQTT client id or cloud device path.
    pub publisher: String,
    pub user: String,
    pub password: String,
    pub topic: String,
    /// PEM CA bundle for TLS sinks.
    pub ca_certificate: String,
    /// PEM client certificate for mutual TLS.
    pub certificate: String,
    /// Encrypted private key. Decrypted once per worker build.
    pub private_key: String,
}

impl Addressable {
    /// True when the protocol asks for a TLS connection.
    pub fn is_tls(&self) -> bool {
        matches!(
            self.protocol.to_ascii_lowercase().as_str(),
            "ssl" | "tls" | "mqtts" | "https"
        )
    }

    /// `{protocol}://{address}:{port}{path}`
    pub fn url(&self) -> String {
        let protocol = if self.protocol.is_empty() {
            "http"
        } else {
            self.protocol.as_str()
        };
        format!(
            "{}://{}:{}{}",
            protocol.to_ascii_lowercase(),
            self.address,
            self.port,
            self.path
        )
    }
}

/// Device and value-descriptor allow-lists. Empty lists disable the filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExportFilter {
    pub device_identifiers: Vec<String>,
    pub value_descriptor_identifiers: Vec<String>,
}

/// Encryption algorithm and key material.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EncryptionDetails {
    pub encryption_algorithm: EncryptionAlgorithm,
    pub encryption_key: String,
    pub initializing_vector: String,
}

/// A named export pipeline configuration.
///
/// `name` is the only identity used to correlate change notifications with
/// live workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Registration {
    pub name: String,
    pub addressable: Addressable,
    pub format: ExportFormat,
    pub filter: ExportFilter,
    pub encryption: EncryptionDetails,
    pub compression: CompressionType,
    pub enable: bool,
    pub destination: Destination,
}
