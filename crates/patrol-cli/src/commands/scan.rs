use patrol_core::models::{CheckInStatus, NewCheckIn};

use crate::commands::common::{normalize_content, open_store, sync_after_capture, CliContext};
use crate::error::CliError;

pub async fn run_scan(
    ctx: &CliContext,
    tag: &str,
    abnormal: bool,
    notes: Option<String>,
    offline: bool,
) -> Result<(), CliError> {
    let tag = normalize_content(tag).ok_or(CliError::EmptyTag)?;

    let mut check_in = NewCheckIn::new(tag).captured_by(ctx.config.operator.clone());
    if abnormal {
        check_in = check_in.with_status(CheckInStatus::Abnormal);
    }
    if let Some(notes) = notes.as_deref().and_then(normalize_content) {
        check_in = check_in.with_notes(notes);
    }

    let store = open_store(&ctx.db_path).await?;
    let saved = store.append_check_in(&check_in).await?;
    println!("{}", saved.offline_id);

    if !offline {
        sync_after_capture(&store, &ctx.config).await;
    }
    Ok(())
}
