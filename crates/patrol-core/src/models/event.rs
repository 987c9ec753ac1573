//! Identifiers and kind-agnostic views over outbox records

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{OperatorId, PendingCheckIn, PendingIncidentReport};

/// Client-generated idempotency key, using UUID v7 (time-sortable)
///
/// Assigned once at capture time and sent with every submission attempt so the
/// ingestion endpoint can collapse retries into a single server record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OfflineId(Uuid);

impl OfflineId {
    /// Create a new unique offline ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for OfflineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OfflineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OfflineId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Store-assigned sequence id of an outbox row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LocalId(i64);

impl LocalId {
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two kinds of field events held in the outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CheckIn,
    IncidentReport,
}

impl EventKind {
    /// Drain order used by the sync orchestrator.
    pub const ALL: [Self; 2] = [Self::CheckIn, Self::IncidentReport];

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::CheckIn => "check_in",
            Self::IncidentReport => "incident_report",
        }
    }

    pub(crate) const fn table(self) -> &'static str {
        match self {
            Self::CheckIn => "check_ins",
            Self::IncidentReport => "incident_reports",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A pending record of either kind, as yielded by the unsynced cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingEvent {
    CheckIn(PendingCheckIn),
    IncidentReport(PendingIncidentReport),
}

impl PendingEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::CheckIn(_) => EventKind::CheckIn,
            Self::IncidentReport(_) => EventKind::IncidentReport,
        }
    }

    #[must_use]
    pub const fn local_id(&self) -> LocalId {
        match self {
            Self::CheckIn(record) => record.local_id,
            Self::IncidentReport(record) => record.local_id,
        }
    }

    #[must_use]
    pub const fn offline_id(&self) -> OfflineId {
        match self {
            Self::CheckIn(record) => record.offline_id,
            Self::IncidentReport(record) => record.offline_id,
        }
    }

    #[must_use]
    pub const fn captured_at(&self) -> i64 {
        match self {
            Self::CheckIn(record) => record.captured_at,
            Self::IncidentReport(record) => record.captured_at,
        }
    }

    /// Operator recorded at capture time
    #[must_use]
    pub const fn operator_id(&self) -> &OperatorId {
        match self {
            Self::CheckIn(record) => &record.operator_id,
            Self::IncidentReport(record) => &record.operator_id,
        }
    }

    #[must_use]
    pub const fn is_synced(&self) -> bool {
        match self {
            Self::CheckIn(record) => record.synced,
            Self::IncidentReport(record) => record.synced,
        }
    }
}

/// Unsynced record counts, recomputed from the store after each drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCounts {
    pub check_ins: u64,
    pub incident_reports: u64,
}

impl PendingCounts {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.check_ins + self.incident_reports
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total() == 0
    }

    #[must_use]
    pub const fn get(&self, kind: EventKind) -> u64 {
        match kind {
            EventKind::CheckIn => self.check_ins,
            EventKind::IncidentReport => self.incident_reports,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_ids_are_unique_and_parse_back() {
        let first = OfflineId::new();
        let second = OfflineId::new();
        assert_ne!(first, second);

        let parsed: OfflineId = first.as_str().parse().unwrap();
        assert_eq!(parsed, first);
    }

    #[test]
    fn pending_counts_total() {
        let counts = PendingCounts {
            check_ins: 3,
            incident_reports: 2,
        };
        assert_eq!(counts.total(), 5);
        assert_eq!(counts.get(EventKind::IncidentReport), 2);
        assert!(!counts.is_empty());
        assert!(PendingCounts::default().is_empty());
    }
}
