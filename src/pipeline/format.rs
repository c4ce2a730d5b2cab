//! Payload formatters.
//!
//! Formatting never fails at runtime: a serialization error is logged and
//! yields an empty payload. The worker treats an empty payload as a failed
//! delivery and does not hand it to the sender.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::error;

use super::{Formatter, Result, StageError};
use crate::models::{Event, ExportFormat};

/// Formatter stage resolved from a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Xml,
    IotCoreJson,
    AzureJson,
    AwsJson,
    ThingsBoardJson,
    Noop,
}

impl Format {
    pub fn from_export_format(format: &ExportFormat) -> Result<Self> {
        Ok(match format {
            ExportFormat::Json => Format::Json,
            ExportFormat::Xml => Format::Xml,
            ExportFormat::IotCoreJson => Format::IotCoreJson,
            ExportFormat::AzureJson => Format::AzureJson,
            ExportFormat::AwsJson => Format::AwsJson,
            ExportFormat::ThingsBoardJson => Format::ThingsBoardJson,
            ExportFormat::Noop => Format::Noop,
            ExportFormat::Unsupported(value) => {
                return Err(StageError::Unsupported {
                    stage: "format",
                    value: value.clone(),
                })
            }
        })
    }
}

impl Formatter for Format {
    fn format(&self, event: &Event) -> Vec<u8> {
        let result = match self {
            Format::Json | Format::IotCoreJson => {
                serde_json::to_vec(event).map_err(|e| e.to_string())
            }
            Format::Xml => quick_xml::se::to_string_with_root("Event", event)
                .map(String::into_bytes)
                .map_err(|e| e.to_string()),
            Format::AzureJson => azure_message(event),
            Format::AwsJson => serde_json::to_vec(&aws_shadow(event)).map_err(|e| e.to_string()),
            Format::ThingsBoardJson => {
                serde_json::to_vec(&thingsboard_telemetry(event)).map_err(|e| e.to_string())
            }
            Format::Noop => Ok(event.raw.clone().unwrap_or_default()),
        };

        result.unwrap_or_else(|e| {
            error!(format = ?self, event_id = %event.id, error = %e, "Failed to format event");
            Vec::new()
        })
    }

    fn content_type(&self) -> &'static str {
        match self {
            Format::Xml => "application/xml",
            Format::Noop => "application/octet-stream",
            _ => "application/json",
        }
    }
}

/// Azure IoT Hub message envelope.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AzureMessage {
    id: String,
    sequence_number: String,
    correlation_id: String,
    user_id: String,
    creation_time_utc: String,
    properties: BTreeMap<String, String>,
    /// Base64 of the event JSON.
    body: String,
}

fn azure_message(event: &Event) -> std::result::Result<Vec<u8>, String> {
    let body = serde_json::to_vec(event).map_err(|e| e.to_string())?;
    let created = if event.created > 0 {
        DateTime::from_timestamp_millis(event.created).unwrap_or_else(Utc::now)
    } else {
        Utc::now()
    };

    let message = AzureMessage {
        id: uuid::Uuid::new_v4().to_string(),
        sequence_number: String::new(),
        correlation_id: event.id.clone(),
        user_id: String::new(),
        creation_time_utc: created.to_rfc3339_opts(SecondsFormat::Millis, true),
        properties: BTreeMap::from([("device".to_string(), event.device.clone())]),
        body: STANDARD.encode(body),
    };
    serde_json::to_vec(&message).map_err(|e| e.to_string())
}

fn reading_values(event: &Event) -> Map<String, Value> {
    event
        .readings
        .iter()
        .map(|r| (r.name.clone(), Value::String(r.value.clone())))
        .collect()
}

/// AWS IoT device shadow update document.
fn aws_shadow(event: &Event) -> Value {
    json!({ "state": { "reported": reading_values(event) } })
}

/// ThingsBoard gateway telemetry document.
fn thingsboard_telemetry(event: &Event) -> Value {
    let mut doc = Map::new();
    doc.insert(
        event.device.clone(),
        json!([{ "ts": event.created, "values": reading_values(event) }]),
    );
    Value::Object(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Reading;

    fn thermostat() -> Event {
        let mut event = Event::new(
            "therm-1",
            vec![Reading::new("temp", "21.5"), Reading::new("humidity", "40")],
        )
        .with_id("e1");
        event.created = 1_700_000_000_000;
        event
    }

    #[test]
    fn test_json_format() {
        let bytes = Format::Json.format(&thermostat());
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["device"], "therm-1");
        assert_eq!(value["readings"][0]["name"], "temp");
        assert_eq!(value["readings"][0]["value"], "21.5");
    }

    #[test]
    fn test_xml_format_has_event_root() {
        let xml = String::from_utf8(Format::Xml.format(&thermostat())).unwrap();
        assert!(xml.starts_with("<Event>"), "{xml}");
        assert!(xml.contains("<device>therm-1</device>"), "{xml}");
        assert!(xml.contains("<name>temp</name>"), "{xml}");
    }

    #[test]
    fn test_aws_shadow_format() {
        let value: Value = serde_json::from_slice(&Format::AwsJson.format(&thermostat())).unwrap();
        assert_eq!(
            value,
            json!({"state": {"reported": {"temp": "21.5", "humidity": "40"}}})
        );
    }

    #[test]
    fn test_thingsboard_format() {
        let value: Value =
            serde_json::from_slice(&Format::ThingsBoardJson.format(&thermostat())).unwrap();
        assert_eq!(value["therm-1"][0]["ts"], 1_700_000_000_000i64);
        assert_eq!(value["therm-1"][0]["values"]["temp"], "21.5");
    }

    #[test]
    fn test_azure_format_wraps_event_json() {
        let value: Value =
            serde_json::from_slice(&Format::AzureJson.format(&thermostat())).unwrap();
        assert_eq!(value["correlationId"], "e1");
        assert_eq!(value["properties"]["device"], "therm-1");
        assert_eq!(value["creationTimeUtc"], "2023-11-14T22:13:20.000Z");

        let body = STANDARD.decode(value["body"].as_str().unwrap()).unwrap();
        let inner: Event = serde_json::from_slice(&body).unwrap();
        assert_eq!(inner.device, "therm-1");
    }

    #[test]
    fn test_noop_passes_raw_payload() {
        let event = Event::from_slice(br#"{"device":"d"}"#).unwrap();
        assert_eq!(Format::Noop.format(&event), br#"{"device":"d"}"#.to_vec());
        assert!(Format::Noop.format(&thermostat()).is_empty());
    }

    #[test]
    fn test_unsupported_format_rejected() {
        let err = Format::from_export_format(&ExportFormat::from("CSV")).unwrap_err();
        assert!(matches!(err, StageError::Unsupported { stage: "format", .. }));
    }
}
