//! Clients for upstream services.

pub mod core_data;

pub use core_data::{CoreDataClient, EventPusher};

/// Errors returned by upstream service clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },
}
