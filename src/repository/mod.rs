//! Read access to export registrations.
//!
//! The registration store itself belongs to another service. The pipeline
//! only lists registrations at startup and fetches one by name when an
//! add notification arrives.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::Registration;

mod http;

pub use http::HttpRegistrationRepository;

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Errors returned by registration lookups.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("registration '{0}' not found")]
    NotFound(String),

    #[error("registration store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed registration payload: {0}")]
    Decode(String),
}

/// Read interface over the registration store.
#[async_trait]
pub trait RegistrationRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<Registration>>;

    /// Fetch one registration. A missing name is [`RepositoryError::NotFound`].
    async fn by_name(&self, name: &str) -> Result<Registration>;
}

/// Registrations held in memory, seeded from configuration or by tests.
#[derive(Debug, Default)]
pub struct InMemoryRegistrations {
    registrations: RwLock<HashMap<String, Registration>>,
}

impl InMemoryRegistrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registrations(registrations: impl IntoIterator<Item = Registration>) -> Self {
        Self {
            registrations: RwLock::new(
                registrations
                    .into_iter()
                    .map(|r| (r.name.clone(), r))
                    .collect(),
            ),
        }
    }

    /// Insert or replace by name.
    pub async fn upsert(&self, registration: Registration) {
        self.registrations
            .write()
            .await
            .insert(registration.name.clone(), registration);
    }

    pub async fn remove(&self, name: &str) -> Option<Registration> {
        self.registrations.write().await.remove(name)
    }
}

#[async_trait]
impl RegistrationRepository for InMemoryRegistrations {
    async fn list(&self) -> Result<Vec<Registration>> {
        let mut all: Vec<Registration> =
            self.registrations.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn by_name(&self, name: &str) -> Result<Registration> {
        self.registrations
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str) -> Registration {
        Registration {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_list_sorted_by_name() {
        let repo = InMemoryRegistrations::with_registrations([named("b"), named("a")]);
        let names: Vec<String> = repo.list().await.unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_by_name_not_found_is_distinguished() {
        let repo = InMemoryRegistrations::new();
        assert!(matches!(
            repo.by_name("missing").await,
            Err(RepositoryError::NotFound(name)) if name == "missing"
        ));
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_remove_deletes() {
        let repo = InMemoryRegistrations::new();
        repo.upsert(named("r1")).await;

        let mut updated = named("r1");
        updated.enable = true;
        repo.upsert(updated).await;
        assert!(repo.by_name("r1").await.unwrap().enable);

        assert!(repo.remove("r1").await.is_some());
        assert!(repo.list().await.unwrap().is_empty());
    }
}
