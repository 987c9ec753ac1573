use patrol_core::sync::{SyncOutcome, SyncReport};
use patrol_core::{EventKind, PendingCounts};
use serde::Serialize;

use crate::commands::common::{build_orchestrator, describe_halt, open_store, CliContext};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct SyncKindItem {
    pub kind: EventKind,
    pub accepted: u64,
    pub halted: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncReportItem {
    pub already_running: bool,
    pub kinds: Vec<SyncKindItem>,
    pub remaining: PendingCounts,
}

pub async fn run_sync(ctx: &CliContext, as_json: bool) -> Result<(), CliError> {
    let store = open_store(&ctx.db_path).await?;
    let orchestrator = build_orchestrator(&store, &ctx.config)?;

    let item = match orchestrator.attempt_sync().await {
        SyncOutcome::Ran(report) => sync_report_item(&report),
        SyncOutcome::AlreadyRunning => SyncReportItem {
            already_running: true,
            kinds: Vec::new(),
            remaining: store.pending_counts().await?,
        },
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&item)?);
    } else {
        for line in format_sync_lines(&item) {
            println!("{line}");
        }
    }

    let remaining = item.remaining.total();
    if remaining > 0 {
        return Err(CliError::SyncIncomplete(remaining));
    }
    Ok(())
}

pub fn sync_report_item(report: &SyncReport) -> SyncReportItem {
    SyncReportItem {
        already_running: false,
        kinds: report
            .kinds
            .iter()
            .map(|kind| SyncKindItem {
                kind: kind.kind,
                accepted: kind.accepted,
                halted: kind.halted.as_ref().map(describe_halt),
            })
            .collect(),
        remaining: report.remaining,
    }
}

pub fn format_sync_lines(item: &SyncReportItem) -> Vec<String> {
    if item.already_running {
        return vec!["A sync is already running.".to_string()];
    }

    let mut lines = item
        .kinds
        .iter()
        .map(|kind| match &kind.halted {
            Some(reason) => format!("{}: {} sent, stopped: {reason}", kind.kind, kind.accepted),
            None => format!("{}: {} sent", kind.kind, kind.accepted),
        })
        .collect::<Vec<_>>();

    if item.remaining.is_empty() {
        lines.push("Sync completed".to_string());
    } else {
        lines.push(format!(
            "{} check-in(s) and {} report(s) still pending",
            item.remaining.check_ins, item.remaining.incident_reports
        ));
    }
    lines
}
