//! Ingestion endpoint client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::models::PendingEvent;
use crate::util::{compact_text, normalize_base_url};
use crate::wire::{
    CheckInSubmission, IncidentReportSubmission, IngestReceipt, CHECK_IN_PATH,
    INCIDENT_REPORT_PATH,
};

/// Why one submission attempt did not end in confirmed acceptance.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Ingestion endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("Submission timed out after {0:?}")]
    Timeout(Duration),
    #[error("Ingestion endpoint rejected submission: {message} (HTTP {status})")]
    Rejected { status: u16, message: String },
    #[error("Invalid ingestion response: {0}")]
    InvalidResponse(String),
}

impl SubmitError {
    /// Whether repeating the same submission later can plausibly succeed.
    ///
    /// Only used for reporting: every failure leaves the record pending.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Unreachable(_) | Self::Timeout(_) | Self::InvalidResponse(_) => true,
            Self::Rejected { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
        }
    }
}

pub type SubmitResult<T> = Result<T, SubmitError>;

/// Delivers one outbox record to the ingestion endpoint.
#[async_trait]
pub trait IngestionClient: Send + Sync {
    /// Submit `event` under the operator recorded on it.
    async fn submit(&self, event: &PendingEvent) -> SubmitResult<IngestReceipt>;
}

/// JSON-over-HTTP client for the ingestion API.
#[derive(Clone)]
pub struct HttpIngestionClient {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpIngestionClient {
    /// Build a client; `timeout` bounds each request end to end.
    pub fn new(api_base_url: &str, timeout: Duration) -> crate::Result<Self> {
        let base_url = normalize_base_url(api_base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| crate::Error::Config(error.to_string()))?;
        Ok(Self {
            base_url,
            timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<T: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> SubmitResult<IngestReceipt> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|error| map_transport_error(&error, self.timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SubmitError::Rejected {
                status: status.as_u16(),
                message: parse_api_error(status, &body),
            });
        }

        let receipt = response
            .json::<IngestReceipt>()
            .await
            .map_err(|error| SubmitError::InvalidResponse(error.to_string()))?;
        if !receipt.accepted {
            return Err(SubmitError::InvalidResponse(
                "endpoint answered without accepting the record".to_string(),
            ));
        }
        Ok(receipt)
    }
}

#[async_trait]
impl IngestionClient for HttpIngestionClient {
    async fn submit(&self, event: &PendingEvent) -> SubmitResult<IngestReceipt> {
        match event {
            PendingEvent::CheckIn(record) => {
                let body = CheckInSubmission::from_pending(record);
                self.post(CHECK_IN_PATH, &body).await
            }
            PendingEvent::IncidentReport(record) => {
                let body = IncidentReportSubmission::from_pending(record);
                self.post(INCIDENT_REPORT_PATH, &body).await
            }
        }
    }
}

fn map_transport_error(error: &reqwest::Error, timeout: Duration) -> SubmitError {
    if error.is_timeout() {
        SubmitError::Timeout(timeout)
    } else {
        SubmitError::Unreachable(error.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return compact_text(&message);
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed
    }
}
