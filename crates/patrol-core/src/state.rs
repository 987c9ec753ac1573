//! Shared cross-platform state types.

use crate::connectivity::Reachability;
use crate::models::PendingCounts;

/// Sync status shown next to the pending count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Offline,
    Syncing,
    /// Reachable, with records still waiting for the next trigger.
    Pending,
    Synced,
}

impl SyncState {
    /// Derive the status from reachability, the in-flight guard and the counts.
    pub const fn derive(reachability: Reachability, syncing: bool, counts: PendingCounts) -> Self {
        if syncing {
            Self::Syncing
        } else if !reachability.is_reachable() {
            Self::Offline
        } else if counts.is_empty() {
            Self::Synced
        } else {
            Self::Pending
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Pending => "pending",
            Self::Synced => "synced",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syncing_wins_over_everything() {
        let counts = PendingCounts {
            check_ins: 2,
            incident_reports: 0,
        };
        assert_eq!(
            SyncState::derive(Reachability::Unreachable, true, counts),
            SyncState::Syncing
        );
        assert_eq!(
            SyncState::derive(Reachability::Unreachable, false, counts),
            SyncState::Offline
        );
        assert_eq!(
            SyncState::derive(Reachability::Reachable, false, counts),
            SyncState::Pending
        );
        assert_eq!(
            SyncState::derive(Reachability::Reachable, false, PendingCounts::default()),
            SyncState::Synced
        );
    }
}
