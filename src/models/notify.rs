//! Registration change notifications.

use serde::{Deserialize, Serialize};

/// Kind of change applied to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyOperation {
    Add,
    Update,
    Delete,
}

/// Signal that the named registration was added, updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyUpdate {
    pub name: String,
    pub operation: NotifyOperation,
}

impl NotifyUpdate {
    pub fn add(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operation: NotifyOperation::Add,
        }
    }

    pub fn update(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operation: NotifyOperation::Update,
        }
    }

    pub fn delete(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operation: NotifyOperation::Delete,
        }
    }
}
