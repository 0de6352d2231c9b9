use serde::{Deserialize, Serialize};

use crate::announcement::Announcement;
use crate::error::{FaultKind, SyncFault};
use crate::ledger::ReadLedger;

/// Lifecycle of a sync engine
///
/// Failures do not change the phase; they ride alongside it as a fault so the
/// last good list stays visible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    /// Nothing fetched yet
    #[default]
    Idle,
    /// First fetch in flight
    Loading,
    /// At least one fetch has succeeded
    Ready,
}

/// An announcement joined with its read flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncementView {
    #[serde(flatten)]
    pub announcement: Announcement,
    pub is_read: bool,
}

/// Ordered announcement views plus the unread count derived from them
///
/// The unread count is computed from the list when the state is built and
/// cannot be set independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    items: Vec<AnnouncementView>,
    unread_count: usize,
    phase: EnginePhase,
    /// Open faults, at most one per kind, in priority order
    faults: Vec<SyncFault>,
}

impl SyncState {
    /// Build the state for an already ordered snapshot
    ///
    /// `faults` may come in any order; only the first fault of each kind is kept.
    pub fn derive(
        snapshot: Vec<Announcement>,
        ledger: &ReadLedger,
        phase: EnginePhase,
        faults: impl IntoIterator<Item = SyncFault>,
    ) -> Self {
        let items: Vec<AnnouncementView> = snapshot
            .into_iter()
            .map(|announcement| {
                let is_read = ledger.is_read(&announcement.id);
                AnnouncementView {
                    announcement,
                    is_read,
                }
            })
            .collect();
        let unread_count = items.iter().filter(|view| !view.is_read).count();

        let mut faults: Vec<SyncFault> = faults.into_iter().collect();
        faults.sort_by_key(|fault| fault.kind);
        faults.dedup_by_key(|fault| fault.kind);

        Self {
            items,
            unread_count,
            phase,
            faults,
        }
    }

    /// Views ordered newest first
    pub fn items(&self) -> &[AnnouncementView] {
        &self.items
    }

    pub fn unread_count(&self) -> usize {
        self.unread_count
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Highest-priority unresolved failure, if any
    pub fn fault(&self) -> Option<&SyncFault> {
        self.faults.first()
    }

    /// Every unresolved failure, one per kind
    pub fn faults(&self) -> &[SyncFault] {
        &self.faults
    }

    pub fn has_fault(&self, kind: FaultKind) -> bool {
        self.faults.iter().any(|fault| fault.kind == kind)
    }

    /// Read flag of a listed announcement; None if it is not in the list
    pub fn is_read(&self, id: &str) -> Option<bool> {
        self.items
            .iter()
            .find(|view| view.announcement.id == id)
            .map(|view| view.is_read)
    }

    /// Ids in list order
    pub fn ids(&self) -> Vec<&str> {
        self.items
            .iter()
            .map(|view| view.announcement.id.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
