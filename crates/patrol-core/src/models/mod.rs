//! Data models for Patrol

mod check_in;
mod event;
mod incident_report;
mod operator;

pub use check_in::{CheckInStatus, NewCheckIn, PendingCheckIn};
pub use event::{EventKind, LocalId, OfflineId, PendingCounts, PendingEvent};
pub use incident_report::{NewIncidentReport, PendingIncidentReport};
pub use operator::{OperatorId, GUEST_OPERATOR_ID};
