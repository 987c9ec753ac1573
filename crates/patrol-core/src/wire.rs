//! Request and response bodies shared by the device client and the ingestion API.

use serde::{Deserialize, Serialize};

use crate::models::{CheckInStatus, PendingCheckIn, PendingIncidentReport};

/// Check-in ingestion route.
pub const CHECK_IN_PATH: &str = "/v1/patrol/upload";
/// Incident report ingestion route.
pub const INCIDENT_REPORT_PATH: &str = "/v1/repair/submit";
/// Liveness route, also used as the reachability probe target.
pub const HEALTH_PATH: &str = "/healthz";

/// Body of a check-in submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInSubmission {
    pub offline_id: String,
    pub tag_id: String,
    /// Client capture time (Unix ms), stored as the record's time.
    pub captured_at: i64,
    pub operator_id: String,
    #[serde(default)]
    pub status: CheckInStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CheckInSubmission {
    pub fn from_pending(record: &PendingCheckIn) -> Self {
        Self {
            offline_id: record.offline_id.as_str(),
            tag_id: record.tag_id.clone(),
            captured_at: record.captured_at,
            operator_id: record.operator_id.as_str().to_string(),
            status: record.status,
            notes: record.notes.clone(),
        }
    }
}

/// Body of an incident report submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentReportSubmission {
    pub offline_id: String,
    pub description: String,
    #[serde(default)]
    pub attachment_refs: Vec<String>,
    pub captured_at: i64,
    pub operator_id: String,
}

impl IncidentReportSubmission {
    pub fn from_pending(record: &PendingIncidentReport) -> Self {
        Self {
            offline_id: record.offline_id.as_str(),
            description: record.description.clone(),
            attachment_refs: record.attachment_refs.clone(),
            captured_at: record.captured_at,
            operator_id: record.operator_id.as_str().to_string(),
        }
    }
}

/// Definitive acceptance returned for a single submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub accepted: bool,
    pub server_record_id: i64,
    /// True when the offline id had already been ingested.
    #[serde(default)]
    pub duplicate: bool,
}

/// JSON error body returned with non-success statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
