//! Pipeline stage abstractions.
//!
//! Every registration resolves its enum fields once, at worker build time,
//! into concrete stage values:
//!
//! ```text
//! Event ──→ [Filter]* ──→ Format ──→ [Compression]? ──→ [Encryption]? ──→ Sender
//! ```
//!
//! Filters may reject an event or narrow its reading set. Formatting is total.
//! Compression always precedes encryption. Senders live in [`crate::sender`].

use std::borrow::Cow;

use crate::models::{CompressionType, EncryptionAlgorithm, Event, Registration};

pub mod compress;
pub mod encrypt;
pub mod filter;
pub mod format;

pub use compress::Compression;
pub use encrypt::{AesCipher, Encryption};
pub use filter::{DeviceIdFilter, Filter, ValueDescriptorFilter};
pub use format::Format;

/// Result type for stage construction and transforms.
pub type Result<T> = std::result::Result<T, StageError>;

/// Errors raised while resolving or running a stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("unsupported {stage} '{value}'")]
    Unsupported { stage: &'static str, value: String },

    #[error("invalid {stage} configuration: {message}")]
    Invalid {
        stage: &'static str,
        message: String,
    },

    #[error("compression failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Decides whether an event continues down the pipeline.
pub trait Filterer: Send + Sync {
    /// Returns the (possibly narrowed) event, or `None` to reject it.
    fn filter<'a>(&self, event: Cow<'a, Event>) -> Option<Cow<'a, Event>>;
}

/// Serializes an event into a wire payload.
pub trait Formatter: Send + Sync {
    fn format(&self, event: &Event) -> Vec<u8>;

    /// MIME type of the formatted payload.
    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

/// Byte-to-byte transform: compression or encryption.
pub trait Transformer: Send + Sync {
    fn transform(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// MIME type of the payload a registration hands to its sender.
///
/// Compressed and encrypted payloads are base64 text.
pub fn payload_content_type(registration: &Registration) -> &'static str {
    let transformed = registration.compression != CompressionType::None
        || registration.encryption.encryption_algorithm != EncryptionAlgorithm::None;
    if transformed {
        return "text/plain";
    }
    Format::from_export_format(&registration.format)
        .map(|f| f.content_type())
        .unwrap_or("application/json")
}
