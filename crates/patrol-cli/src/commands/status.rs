use patrol_core::config::ClientConfig;
use patrol_core::connectivity::{HttpReachabilityProbe, Reachability, ReachabilityProbe};
use patrol_core::state::SyncState;
use patrol_core::PendingCounts;
use serde::Serialize;

use crate::commands::common::{open_store, CliContext};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusItem {
    pub state: &'static str,
    pub reachable: bool,
    pub api_base_url: Option<String>,
    pub operator: String,
    pub pending: PendingCounts,
    pub db_path: String,
}

pub async fn run_status(ctx: &CliContext, as_json: bool) -> Result<(), CliError> {
    let store = open_store(&ctx.db_path).await?;
    let pending = store.pending_counts().await?;
    let reachability = probe_once(&ctx.config).await?;
    let state = SyncState::derive(reachability, false, pending);

    let item = StatusItem {
        state: state.label(),
        reachable: reachability.is_reachable(),
        api_base_url: ctx.config.api_base_url.clone(),
        operator: ctx.config.operator.as_str().to_string(),
        pending,
        db_path: ctx.db_path.display().to_string(),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&item)?);
        return Ok(());
    }

    for line in format_status_lines(&item) {
        println!("{line}");
    }
    Ok(())
}

/// One probe against the configured endpoint. Unconfigured counts as offline.
pub async fn probe_once(config: &ClientConfig) -> Result<Reachability, CliError> {
    let Some(base_url) = config.api_base_url.as_deref() else {
        return Ok(Reachability::Unreachable);
    };
    let probe = HttpReachabilityProbe::new(base_url, config.submit_timeout)?;
    Ok(probe.check().await)
}

pub fn format_status_lines(item: &StatusItem) -> Vec<String> {
    vec![
        format!("State:            {}", item.state),
        format!(
            "Endpoint:         {}",
            item.api_base_url.as_deref().unwrap_or("(not configured)")
        ),
        format!("Operator:         {}", item.operator),
        format!("Pending check-ins: {}", item.pending.check_ins),
        format!("Pending reports:   {}", item.pending.incident_reports),
        format!("Database:         {}", item.db_path),
    ]
}
