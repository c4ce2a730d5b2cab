//! Registration store reached over its REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use tracing::debug;

use super::{RegistrationRepository, RepositoryError, Result};
use crate::models::Registration;

/// `GET {base}/api/v1/registration` and `GET {base}/api/v1/registration/name/{name}`.
#[derive(Debug, Clone)]
pub struct HttpRegistrationRepository {
    client: Client,
    base_url: Url,
}

impl HttpRegistrationRepository {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;
        let base_url = base_url.into();
        let base_url = Url::parse(&base_url).map_err(|e| {
            RepositoryError::Unavailable(format!(
                "invalid registration service URL {}: {}",
                base_url, e
            ))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(RepositoryError::Unavailable(format!(
                "registration service URL {} cannot carry a path",
                base_url
            )));
        }
        Ok(Self { client, base_url })
    }

    /// Base URL extended with `segments`, each percent-encoded as one path segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RepositoryError::Unavailable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let body = response
            .json::<T>()
            .await
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;
        Ok(Some(body))
    }
}

#[async_trait]
impl RegistrationRepository for HttpRegistrationRepository {
    async fn list(&self) -> Result<Vec<Registration>> {
        let url = self.endpoint(&["api", "v1", "registration"]);
        let registrations: Vec<Registration> = self.get(url).await?.unwrap_or_default();
        debug!(count = registrations.len(), "Fetched registrations");
        Ok(registrations)
    }

    async fn by_name(&self, name: &str) -> Result<Registration> {
        let url = self.endpoint(&["api", "v1", "registration", "name", name]);
        self.get(url)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(name.to_string()))
    }
}
