//! Export distribution pipeline.
//!
//! Reads device events from the message bus and fans them out to every
//! registered external destination. Each registration owns an isolated
//! filter, format, compress, encrypt and send chain running as its own
//! task, and registrations can be added, updated or deleted at runtime
//! without disturbing the others.

pub mod bus;
pub mod clients;
pub mod config;
pub mod dispatch;
pub mod keys;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod repository;
pub mod sender;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod utils;
pub mod worker;
