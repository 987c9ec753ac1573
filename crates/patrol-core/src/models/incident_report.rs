//! Incident report model

use serde::{Deserialize, Serialize};

use super::{LocalId, OfflineId, OperatorId};

/// An anomaly report captured on the device, before the store assigns ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncidentReport {
    pub description: String,
    /// Locally held image references, in the order the operator attached them
    pub attachment_refs: Vec<String>,
    /// Capture timestamp (Unix ms)
    pub captured_at: i64,
    pub operator_id: OperatorId,
}

impl NewIncidentReport {
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            attachment_refs: Vec::new(),
            captured_at: chrono::Utc::now().timestamp_millis(),
            operator_id: OperatorId::guest(),
        }
    }

    #[must_use]
    pub fn with_attachment(mut self, attachment_ref: impl Into<String>) -> Self {
        self.attachment_refs.push(attachment_ref.into());
        self
    }

    #[must_use]
    pub const fn captured_at(mut self, captured_at: i64) -> Self {
        self.captured_at = captured_at;
        self
    }

    #[must_use]
    pub fn captured_by(mut self, operator_id: OperatorId) -> Self {
        self.operator_id = operator_id;
        self
    }
}

/// An incident report held in the local outbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIncidentReport {
    pub local_id: LocalId,
    pub offline_id: OfflineId,
    pub description: String,
    pub attachment_refs: Vec<String>,
    pub captured_at: i64,
    pub operator_id: OperatorId,
    pub synced: bool,
}

impl PendingIncidentReport {
    /// First attachment, if any
    #[must_use]
    pub fn primary_attachment(&self) -> Option<&str> {
        self.attachment_refs.first().map(String::as_str)
    }
}
