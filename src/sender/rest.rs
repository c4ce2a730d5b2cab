//! Generic HTTP(S) sink.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use tracing::{debug, warn};

use super::{Sender, SenderError, SenderSettings};
use crate::models::{Event, Registration};
use crate::pipeline::payload_content_type;

/// POSTs (or PUTs) each payload to `{protocol}://{address}:{port}{path}`.
pub struct RestSender {
    client: Client,
    url: String,
    method: Method,
    content_type: &'static str,
}

impl RestSender {
    pub fn new(
        registration: &Registration,
        settings: &SenderSettings,
    ) -> Result<Self, SenderError> {
        let addr = &registration.addressable;
        if addr.address.is_empty() {
            return Err(SenderError::Config("REST address is empty".to_string()));
        }

        let method = match addr.method.to_ascii_uppercase().as_str() {
            "" | "POST" => Method::POST,
            "PUT" => Method::PUT,
            other => {
                return Err(SenderError::Config(format!(
                    "unsupported HTTP method '{}'",
                    other
                )))
            }
        };

        let client = Client::builder().timeout(settings.http_timeout()).build()?;

        Ok(Self {
            client,
            url: addr.url(),
            method,
            content_type: payload_content_type(registration),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Sender for RestSender {
    async fn send(&mut self, payload: &[u8], event: &Event) -> bool {
        let result = self
            .client
            .request(self.method.clone(), &self.url)
            .header(CONTENT_TYPE, self.content_type)
            .body(payload.to_vec())
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(url = %self.url, event_id = %event.id, "Delivered event to REST endpoint");
                true
            }
            Ok(response) => {
                warn!(url = %self.url, status = %response.status(), "REST endpoint rejected event");
                false
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "REST request failed");
                false
            }
        }
    }

    fn protocol(&self) -> &'static str {
        "rest"
    }
}
