//! Inbound event bus.
//!
//! Events arrive as newline-framed JSON over a TCP subscription. Malformed
//! frames are logged and dropped. A lost connection is re-established with
//! exponential backoff; the subscriber only stops when the dispatch loop
//! stops accepting events.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::models::Event;
use crate::utils::retry::bus_backoff;

/// Bus connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5563,
        }
    }
}

impl BusConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Decode one bus frame. Returns `None`, after logging, for malformed input.
pub fn decode_event(frame: &[u8]) -> Option<Event> {
    match Event::from_slice(frame) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, bytes = frame.len(), "Dropping malformed event");
            None
        }
    }
}

/// Why a subscription session ended.
enum SessionEnd {
    /// Connection dropped; reconnect.
    Disconnected,
    /// The dispatch loop went away.
    Closed,
}

/// Subscribes to the bus and forwards decoded events.
#[derive(Debug, Clone)]
pub struct TcpSubscriber {
    address: String,
}

impl TcpSubscriber {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            address: config.address(),
        }
    }

    /// Receive until `events` is closed, reconnecting as needed.
    pub async fn run(self, events: mpsc::Sender<Arc<Event>>) {
        loop {
            let stream = match self.connect().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(address = %self.address, error = %e, "Bus unreachable, restarting backoff");
                    if events.is_closed() {
                        return;
                    }
                    continue;
                }
            };
            info!(address = %self.address, "Subscribed to event bus");

            match Self::receive(stream, &events).await {
                SessionEnd::Closed => {
                    info!("Event consumer closed, unsubscribing");
                    return;
                }
                SessionEnd::Disconnected => {
                    warn!(address = %self.address, "Bus connection lost, reconnecting");
                }
            }
        }
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        let address = self.address.clone();
        (|| {
            let a = address.clone();
            async move { TcpStream::connect(a).await }
        })
        .retry(bus_backoff())
        .notify(|err: &std::io::Error, dur: Duration| {
            warn!(address = %address, error = %err, delay = ?dur, "Bus connection failed, retrying");
        })
        .await
    }

    async fn receive(stream: TcpStream, events: &mpsc::Sender<Arc<Event>>) -> SessionEnd {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => return SessionEnd::Disconnected,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Bus read failed");
                    return SessionEnd::Disconnected;
                }
            }

            // Frames are raw bytes; invalid UTF-8 is just another malformed event.
            let frame = buf.trim_ascii();
            if frame.is_empty() {
                continue;
            }
            let Some(event) = decode_event(frame) else {
                continue;
            };
            debug!(event_id = %event.id, device = %event.device, "Received event");
            if events.send(Arc::new(event)).await.is_err() {
                return SessionEnd::Closed;
            }
        }
    }
}
