use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::announcement::{Announcement, AnnouncementPatch};

/// In-memory set of announcements for the current session
///
/// The cache is filled wholesale by a bulk fetch and then kept current by
/// feed events. Every mutation is idempotent so duplicate deliveries are
/// harmless.
pub struct AnnouncementCache {
    records: DashMap<String, Announcement>,
}

impl AnnouncementCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Replace the whole cache with the result of a bulk fetch
    pub fn load_initial(&self, items: Vec<Announcement>) {
        self.records.clear();
        for item in items {
            self.records.insert(item.id.clone(), item);
        }
        debug!("Loaded {} announcements into cache", self.records.len());
    }

    /// Insert a newly created announcement
    ///
    /// Returns false (and leaves the cache untouched) if the id is already present.
    pub fn apply_create(&self, item: Announcement) -> bool {
        match self.records.entry(item.id.clone()) {
            Entry::Occupied(_) => {
                debug!("Ignoring duplicate create for announcement '{}'", item.id);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(item);
                true
            }
        }
    }

    /// Merge a partial update into an existing record
    ///
    /// Updates for unknown ids are dropped; the next bulk fetch reconciles them.
    /// Returns true if the record changed.
    pub fn apply_update(&self, patch: &AnnouncementPatch) -> bool {
        match self.records.get_mut(&patch.id) {
            Some(mut record) => record.merge(patch),
            None => {
                debug!(
                    "Dropping update for unknown announcement '{}' until next refresh",
                    patch.id
                );
                false
            }
        }
    }

    /// Remove a record. Returns true if it was present.
    pub fn apply_delete(&self, id: &str) -> bool {
        self.records.remove(id).is_some()
    }

    /// Current records, newest first, ties broken by id
    pub fn snapshot(&self) -> Vec<Announcement> {
        let mut items: Vec<Announcement> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        items.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        items
    }

    /// Ids of every cached announcement
    pub fn ids(&self) -> Vec<String> {
        self.records.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<Announcement> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for AnnouncementCache {
    fn default() -> Self {
        Self::new()
    }
}
