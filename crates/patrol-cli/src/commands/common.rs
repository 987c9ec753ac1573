use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use patrol_core::config::ClientConfig;
use patrol_core::models::CheckInStatus;
use patrol_core::services::OutboxStore;
use patrol_core::sync::{HaltReason, HttpIngestionClient, SyncOrchestrator, SyncOutcome};
use patrol_core::util::normalize_text_option;
use patrol_core::{EventKind, PendingEvent};
use serde::Serialize;

use crate::error::CliError;

/// Resolved settings shared by every command.
pub struct CliContext {
    pub config: ClientConfig,
    pub db_path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct HistoryItem {
    pub kind: EventKind,
    pub local_id: i64,
    pub offline_id: String,
    pub captured_at: i64,
    pub captured_at_utc: String,
    pub relative_time: String,
    pub summary: String,
    pub synced: bool,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>, config: &ClientConfig) -> PathBuf {
    cli_db_path
        .or_else(|| config.db_path.clone())
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("patrol")
        .join("outbox.db")
}

pub async fn open_store(path: &Path) -> Result<OutboxStore, CliError> {
    Ok(OutboxStore::open_path(path).await?)
}

/// Orchestrator bound to the configured ingestion API.
pub fn build_orchestrator(
    store: &OutboxStore,
    config: &ClientConfig,
) -> Result<Arc<SyncOrchestrator>, CliError> {
    let base_url = config
        .api_base_url
        .as_deref()
        .ok_or(CliError::SyncNotConfigured)?;
    let client = HttpIngestionClient::new(base_url, config.submit_timeout)?;
    Ok(Arc::new(SyncOrchestrator::new(
        store.clone(),
        Arc::new(client),
        config.submit_timeout,
    )))
}

/// Best-effort sync right after a capture. Failures leave the record pending.
pub async fn sync_after_capture(store: &OutboxStore, config: &ClientConfig) {
    if config.api_base_url.is_none() {
        println!("Saved offline; run `patrol sync` once PATROL_API_BASE_URL is set.");
        return;
    }

    let orchestrator = match build_orchestrator(store, config) {
        Ok(orchestrator) => orchestrator,
        Err(error) => {
            tracing::warn!(%error, "Could not start sync");
            return;
        }
    };
    match orchestrator.attempt_sync().await {
        SyncOutcome::Ran(report) if report.is_complete() => println!("Synced."),
        SyncOutcome::Ran(report) => println!(
            "Saved offline; {} record(s) pending until the next sync.",
            report.remaining.total()
        ),
        SyncOutcome::AlreadyRunning => println!("Saved; a sync is already running."),
    }
}

pub fn normalize_content(content: &str) -> Option<String> {
    normalize_text_option(Some(content.to_string()))
}

pub fn describe_halt(reason: &HaltReason) -> String {
    match reason {
        HaltReason::Submit(error) if error.is_retryable() => format!("{error} (will retry)"),
        HaltReason::Submit(error) => format!("{error} (needs attention)"),
        HaltReason::Storage(message) => format!("local storage error: {message}"),
        HaltReason::Superseded => "another process took over the drain".to_string(),
    }
}

pub fn history_item(event: &PendingEvent, now_ms: i64) -> HistoryItem {
    let summary = match event {
        PendingEvent::CheckIn(record) => {
            let mut summary = format!("tag {}", record.tag_id);
            if record.status == CheckInStatus::Abnormal {
                summary.push_str(" [ABNORMAL]");
            }
            if let Some(notes) = &record.notes {
                summary.push_str(" - ");
                summary.push_str(&preview(notes, 40));
            }
            summary
        }
        PendingEvent::IncidentReport(record) => {
            let mut summary = preview(&record.description, 48);
            if !record.attachment_refs.is_empty() {
                summary.push_str(&format!(" (+{} attachment(s))", record.attachment_refs.len()));
            }
            summary
        }
    };

    HistoryItem {
        kind: event.kind(),
        local_id: event.local_id().get(),
        offline_id: event.offline_id().to_string(),
        captured_at: event.captured_at(),
        captured_at_utc: format_timestamp(event.captured_at()),
        relative_time: format_relative_time(event.captured_at(), now_ms),
        summary,
        synced: event.is_synced(),
    }
}

pub fn format_history_lines(events: &[PendingEvent]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    events
        .iter()
        .map(|event| {
            let item = history_item(event, now_ms);
            let state = if item.synced { "synced" } else { "pending" };
            format!(
                "{:<15}  {:<7}  {:<10}  {}",
                item.kind.label(),
                state,
                item.relative_time,
                item.summary
            )
        })
        .collect()
}

pub fn preview(text: &str, max_chars: usize) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let truncated: String = single_line.chars().take(max_chars).collect();
        format!("{truncated}...")
    }
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
