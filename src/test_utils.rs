//! Test utilities and mock implementations.
//!
//! In-memory stand-ins for the protocol senders and the upstream event
//! store so workers and the dispatch loop can be exercised without brokers
//! or HTTP sinks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::clients::{ClientError, EventPusher};
use crate::keys::KeyDecrypter;
use crate::models::{Event, Reading, Registration};
use crate::sender::{Sender, SenderError, SenderFactory};

/// One payload observed by a [`RecordingSender`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    /// Sink the sender was built for, taken from the addressable's address.
    pub sink: String,
    pub event_id: String,
    pub payload: Vec<u8>,
}

/// Shared log of every delivery, keyed by registration name.
#[derive(Debug, Clone, Default)]
pub struct DeliveryLog {
    inner: Arc<Mutex<HashMap<String, Vec<Delivered>>>>,
    released: Arc<Mutex<Vec<String>>>,
}

impl DeliveryLog {
    fn record(&self, registration: &str, delivered: Delivered) {
        if let Ok(mut log) = self.inner.lock() {
            log.entry(registration.to_string()).or_default().push(delivered);
        }
    }

    /// Deliveries for one registration, in arrival order.
    pub fn for_registration(&self, name: &str) -> Vec<Delivered> {
        self.inner
            .lock()
            .map(|log| log.get(name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// How many senders built for `name` have been dropped. A worker drops
    /// its sender when its task exits or its pipeline is replaced.
    pub fn released(&self, name: &str) -> usize {
        self.released
            .lock()
            .map(|released| released.iter().filter(|r| r.as_str() == name).count())
            .unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.inner
            .lock()
            .map(|log| log.values().map(Vec::len).sum())
            .unwrap_or_default()
    }
}

/// Sender that appends every payload to a [`DeliveryLog`].
pub struct RecordingSender {
    registration: String,
    sink: String,
    log: DeliveryLog,
    accept: bool,
    /// Time spent in each send after recording it.
    delay: Option<Duration>,
}

impl Drop for RecordingSender {
    fn drop(&mut self) {
        if let Ok(mut released) = self.log.released.lock() {
            released.push(self.registration.clone());
        }
    }
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&mut self, payload: &[u8], event: &Event) -> bool {
        if !self.accept {
            return false;
        }
        self.log.record(
            &self.registration,
            Delivered {
                sink: self.sink.clone(),
                event_id: event.id.clone(),
                payload: payload.to_vec(),
            },
        );
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        true
    }

    fn protocol(&self) -> &'static str {
        "recording"
    }
}

/// How long a `slow` sink takes per send.
pub const SLOW_SEND: Duration = Duration::from_millis(300);

/// Factory producing [`RecordingSender`]s for every destination.
///
/// Registrations whose addressable address is `reject` fail to build, and
/// those whose address is `down` build but refuse every send. A `slow` sink
/// records each payload and then holds the send for [`SLOW_SEND`].
#[derive(Debug, Clone, Default)]
pub struct RecordingSenders {
    pub log: DeliveryLog,
}

impl RecordingSenders {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SenderFactory for RecordingSenders {
    fn build(
        &self,
        registration: &Registration,
        _keys: &dyn KeyDecrypter,
    ) -> Result<Box<dyn Sender>, SenderError> {
        let sink = registration.addressable.address.clone();
        if sink == "reject" {
            return Err(SenderError::Config("sink rejected".to_string()));
        }
        Ok(Box::new(RecordingSender {
            registration: registration.name.clone(),
            accept: sink != "down",
            delay: (sink == "slow").then_some(SLOW_SEND),
            sink,
            log: self.log.clone(),
        }))
    }
}

/// Event pusher that remembers which event ids were marked.
#[derive(Debug, Clone, Default)]
pub struct RecordingPusher {
    pushed: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl RecordingPusher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pusher whose every call errors.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn pushed(&self) -> Vec<String> {
        self.pushed
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventPusher for RecordingPusher {
    async fn mark_pushed(&self, event_id: &str) -> Result<(), ClientError> {
        if let Ok(mut pushed) = self.pushed.lock() {
            pushed.push(event_id.to_string());
        }
        if self.fail {
            return Err(ClientError::Status {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                url: format!("memory://event/{}", event_id),
            });
        }
        Ok(())
    }
}

/// Enabled JSON registration delivering to `sink`, optionally restricted to devices.
pub fn make_registration(name: &str, sink: &str, devices: &[&str]) -> Registration {
    let mut registration = Registration {
        name: name.to_string(),
        enable: true,
        ..Default::default()
    };
    registration.addressable.address = sink.to_string();
    registration.filter.device_identifiers = devices.iter().map(|d| d.to_string()).collect();
    registration
}

/// Event with one reading.
pub fn make_event(id: &str, device: &str, name: &str, value: &str) -> Event {
    Event::new(device, vec![Reading::new(name, value)]).with_id(id)
}
