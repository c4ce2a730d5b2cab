//! Domain types shared by the pipeline, its collaborators and the binary.

mod event;
mod notify;
mod registration;

pub use event::{Event, Reading};
pub use notify::{NotifyOperation, NotifyUpdate};
pub use registration::{
    Addressable, CompressionType, Destination, EncryptionAlgorithm, EncryptionDetails,
    ExportFilter, ExportFormat, Registration,
};
