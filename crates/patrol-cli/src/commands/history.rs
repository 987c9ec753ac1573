use chrono::Utc;
use patrol_core::{EventKind, PendingEvent};

use crate::commands::common::{
    format_history_lines, history_item, open_store, CliContext, HistoryItem,
};
use crate::error::CliError;

pub async fn run_history(
    ctx: &CliContext,
    kind: Option<EventKind>,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let store = open_store(&ctx.db_path).await?;
    let kinds = kind.map_or_else(|| EventKind::ALL.to_vec(), |kind| vec![kind]);

    let mut events = Vec::new();
    for kind in kinds {
        events.extend(store.history(kind, limit).await?);
    }
    let events = newest_first(events, limit);

    if as_json {
        let now_ms = Utc::now().timestamp_millis();
        let items = events
            .iter()
            .map(|event| history_item(event, now_ms))
            .collect::<Vec<HistoryItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if events.is_empty() {
        println!("Nothing captured yet.");
    } else {
        for line in format_history_lines(&events) {
            println!("{line}");
        }
    }
    Ok(())
}

/// Merge per-kind history into one list, newest capture first.
pub fn newest_first(mut events: Vec<PendingEvent>, limit: usize) -> Vec<PendingEvent> {
    events.sort_by(|a, b| {
        b.captured_at()
            .cmp(&a.captured_at())
            .then_with(|| b.local_id().cmp(&a.local_id()))
    });
    events.truncate(limit);
    events
}
