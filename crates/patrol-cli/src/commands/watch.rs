use std::sync::Arc;

use patrol_core::connectivity::{ConnectivityMonitor, HttpReachabilityProbe, ReachabilityProbe};
use patrol_core::state::SyncState;
use patrol_core::sync::{SyncEvent, SyncOrchestrator, SyncWorker};
use tokio::sync::{broadcast, watch};

use crate::commands::common::{build_orchestrator, describe_halt, open_store, CliContext};
use crate::commands::sync::{format_sync_lines, sync_report_item};
use crate::error::CliError;

/// Run the background sync loop in the foreground until Ctrl-C.
pub async fn run_watch(ctx: &CliContext) -> Result<(), CliError> {
    let base_url = ctx.config.require_api_base_url()?;
    let store = open_store(&ctx.db_path).await?;
    let orchestrator = build_orchestrator(&store, &ctx.config)?;
    orchestrator.refresh_counts().await?;

    let probe: Arc<dyn ReachabilityProbe> = Arc::new(HttpReachabilityProbe::new(
        base_url,
        ctx.config.submit_timeout,
    )?);
    let monitor = ConnectivityMonitor::start(probe.as_ref()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let polling = monitor.spawn_polling(probe, ctx.config.probe_interval, shutdown_rx.clone());
    let (_handle, worker) = SyncWorker::spawn(
        orchestrator.clone(),
        &monitor,
        ctx.config.sync_interval,
        shutdown_rx,
    );

    let mut events = orchestrator.subscribe_events();
    let mut counts = orchestrator.subscribe_counts();
    let mut reachability = monitor.watch();

    println!(
        "Watching {base_url} as {} (Ctrl-C to stop)",
        ctx.config.operator
    );
    print_state(&monitor, &orchestrator);

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = &mut interrupted => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Sync event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = counts.changed() => {
                if changed.is_err() {
                    break;
                }
                print_state(&monitor, &orchestrator);
            }
            changed = reachability.changed() => {
                if changed.is_err() {
                    break;
                }
                print_state(&monitor, &orchestrator);
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = worker.await;
    let _ = polling.await;
    println!("Stopped.");
    Ok(())
}

fn print_state(monitor: &ConnectivityMonitor, orchestrator: &SyncOrchestrator) {
    let counts = orchestrator.pending_counts();
    let state = SyncState::derive(monitor.current(), orchestrator.is_syncing(), counts);
    println!(
        "[{state}] {} check-in(s), {} report(s) pending",
        counts.check_ins, counts.incident_reports
    );
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::Deferred { kind, reason } => {
            println!("{kind}: deferred, {}", describe_halt(reason));
        }
        SyncEvent::Finished(report) => {
            for line in format_sync_lines(&sync_report_item(report)) {
                println!("{line}");
            }
        }
        SyncEvent::Complete => println!("All records delivered."),
    }
}
