//! Delivery acknowledgement against the upstream event store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::ClientError;

/// Records that an event reached at least one destination.
#[async_trait]
pub trait EventPusher: Send + Sync {
    async fn mark_pushed(&self, event_id: &str) -> Result<(), ClientError>;
}

#[derive(Debug, Serialize)]
struct PushedBody {
    pushed: i64,
}

/// Core-data REST client: `PUT {base}/api/v1/event/id/{id}`.
#[derive(Debug, Clone)]
pub struct CoreDataClient {
    client: Client,
    base_url: String,
}

impl CoreDataClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn event_url(&self, event_id: &str) -> String {
        format!("{}/api/v1/event/id/{}", self.base_url, event_id)
    }
}

#[async_trait]
impl EventPusher for CoreDataClient {
    async fn mark_pushed(&self, event_id: &str) -> Result<(), ClientError> {
        let url = self.event_url(event_id);
        let body = PushedBody {
            pushed: chrono::Utc::now().timestamp_millis(),
        };
        let response = self.client.put(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Status {
                status: response.status(),
                url,
            });
        }
        Ok(())
    }
}
