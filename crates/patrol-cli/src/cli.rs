use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use patrol_core::EventKind;

#[derive(Parser)]
#[command(name = "patrol")]
#[command(about = "Record patrol check-ins and incident reports, online or offline")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the local outbox file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Operator recorded on new captures (overrides PATROL_OPERATOR_ID)
    #[arg(long, global = true, value_name = "ID")]
    pub operator: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a check-in for a scanned tag
    Scan {
        /// Tag identifier read at the checkpoint
        tag: String,
        /// Mark the checkpoint as abnormal
        #[arg(long)]
        abnormal: bool,
        /// Free-text notes
        #[arg(long)]
        notes: Option<String>,
        /// Only record locally; skip the immediate sync attempt
        #[arg(long)]
        offline: bool,
    },
    /// Record an incident report
    #[command(alias = "repair")]
    Report {
        /// Description of the problem
        description: Vec<String>,
        /// Attachment reference (repeatable)
        #[arg(long = "attachment", value_name = "REF")]
        attachments: Vec<String>,
        /// Only record locally; skip the immediate sync attempt
        #[arg(long)]
        offline: bool,
    },
    /// Show pending counts and connectivity
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List locally recorded events, newest first
    History {
        /// Restrict to one kind of event
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
        /// Number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Submit pending events now
    Sync {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep syncing in the foreground until interrupted
    Watch,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KindArg {
    CheckIn,
    IncidentReport,
}

impl From<KindArg> for EventKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::CheckIn => Self::CheckIn,
            KindArg::IncidentReport => Self::IncidentReport,
        }
    }
}
