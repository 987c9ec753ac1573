//! Check-in model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

use super::{LocalId, OfflineId, OperatorId};

/// Outcome recorded by the operator at a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckInStatus {
    #[default]
    Normal,
    Abnormal,
}

impl CheckInStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Abnormal => "ABNORMAL",
        }
    }
}

impl fmt::Display for CheckInStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckInStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(Self::Normal),
            "ABNORMAL" => Ok(Self::Abnormal),
            other => Err(Error::InvalidInput(format!(
                "unknown check-in status: {other}"
            ))),
        }
    }
}

/// A scan captured on the device, before the store assigns ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCheckIn {
    /// Opaque identifier of the scanned location tag
    pub tag_id: String,
    /// Operator-reported status at the checkpoint
    pub status: CheckInStatus,
    /// Optional free-text notes
    pub notes: Option<String>,
    /// Capture timestamp (Unix ms)
    pub captured_at: i64,
    /// Operator signed in when the scan was taken
    pub operator_id: OperatorId,
}

impl NewCheckIn {
    /// Create a normal check-in captured now
    #[must_use]
    pub fn new(tag_id: impl Into<String>) -> Self {
        Self {
            tag_id: tag_id.into(),
            status: CheckInStatus::Normal,
            notes: None,
            captured_at: chrono::Utc::now().timestamp_millis(),
            operator_id: OperatorId::guest(),
        }
    }

    #[must_use]
    pub const fn with_status(mut self, status: CheckInStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
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

/// A check-in held in the local outbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCheckIn {
    /// Local sequence id
    pub local_id: LocalId,
    /// Idempotency key sent to the ingestion endpoint
    pub offline_id: OfflineId,
    /// Scanned tag identifier
    pub tag_id: String,
    /// Capture timestamp (Unix ms)
    pub captured_at: i64,
    /// Operator-reported status
    pub status: CheckInStatus,
    /// Optional free-text notes
    pub notes: Option<String>,
    /// Operator who captured the scan; submitted as-is on every attempt
    pub operator_id: OperatorId,
    /// Set once the endpoint confirmed acceptance
    pub synced: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!(
            "abnormal".parse::<CheckInStatus>().unwrap(),
            CheckInStatus::Abnormal
        );
        assert_eq!(
            " NORMAL ".parse::<CheckInStatus>().unwrap(),
            CheckInStatus::Normal
        );
        assert!("broken".parse::<CheckInStatus>().is_err());
    }

    #[test]
    fn status_serializes_as_wire_value() {
        let json = serde_json::to_string(&CheckInStatus::Abnormal).unwrap();
        assert_eq!(json, "\"ABNORMAL\"");
    }

    #[test]
    fn new_check_in_defaults_to_normal_now() {
        let scan = NewCheckIn::new("tag-42");
        assert_eq!(scan.status, CheckInStatus::Normal);
        assert!(scan.notes.is_none());
        assert!(scan.captured_at > 0);
    }
}
