//! Coordinator state exposed read-only to consumers.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::cache::CacheStats;

/// Sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    /// The server reported conflicts; cleared only by a later successful sync.
    Conflicted,
    /// The last sync or reload failed; see [`SyncErrors`].
    Error,
}

/// Local menu version and conflict status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    /// Only ever increases.
    pub current: u64,
    pub has_conflicts: bool,
    pub conflict_items: BTreeSet<String>,
}

/// Last failure per activity, cleared when the activity next starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncErrors {
    pub syncing: Option<String>,
    pub loading: Option<String>,
}

/// What a `sync_menu_version` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Local version already matched the server.
    UpToDate { version: u64 },
    /// Deltas applied and the version advanced.
    Applied { version: u64, updates: usize },
    /// Menus and tools were refetched in full and the version advanced.
    Reloaded { version: u64 },
    /// The server reported conflicts; the version was not advanced.
    Conflicted { items: Vec<String> },
    /// A newer operation started before this one committed; its result was
    /// discarded.
    Superseded,
}

impl SyncOutcome {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::UpToDate { .. } => "up_to_date",
            Self::Applied { .. } => "applied",
            Self::Reloaded { .. } => "reloaded",
            Self::Conflicted { .. } => "conflicted",
            Self::Superseded => "superseded",
        }
    }
}

/// What an incremental update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The whole batch applied.
    Applied { updates: usize },
    /// A full reload was requested instead of a delta.
    Reloaded,
    /// The batch failed and a full reload replaced it.
    ReloadedAfterFailure,
    /// A newer operation superseded this one.
    Superseded,
}

/// Change notifications for UI subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum MenuEvent {
    /// Menu or tools snapshots were replaced.
    MenusChanged { version: u64 },
    /// The sync state machine moved.
    StateChanged { state: SyncState },
    /// Cache statistics after a refresh.
    CacheStatsRefreshed(CacheStats),
}
