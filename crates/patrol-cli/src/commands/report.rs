use patrol_core::models::NewIncidentReport;

use crate::commands::common::{normalize_content, open_store, sync_after_capture, CliContext};
use crate::error::CliError;

pub async fn run_report(
    ctx: &CliContext,
    description_parts: &[String],
    attachments: &[String],
    offline: bool,
) -> Result<(), CliError> {
    let description =
        normalize_content(&description_parts.join(" ")).ok_or(CliError::EmptyDescription)?;

    let report = attachments
        .iter()
        .filter_map(|attachment| normalize_content(attachment))
        .fold(
            NewIncidentReport::new(description).captured_by(ctx.config.operator.clone()),
            |report, attachment| report.with_attachment(attachment),
        );

    let store = open_store(&ctx.db_path).await?;
    let saved = store.append_incident_report(&report).await?;
    println!("{}", saved.offline_id);

    if !offline {
        sync_after_capture(&store, &ctx.config).await;
    }
    Ok(())
}
