//! Read-state ledger
//!
//! The ledger is the set of announcement ids the local user has read. It is
//! held in memory and mirrored to a [`PersistenceMedium`] as a JSON array.
//! Several engines may share one medium; every write first re-reads the
//! medium and merges it, so a write only ever adds ids.
//!
//! Membership in memory is monotonic: loads merge into the current set and
//! a failed write keeps the in-memory mark. Only [`ReadLedger::reset`] ever
//! removes ids.

pub mod medium;

pub use medium::{MemoryMedium, PersistenceMedium};

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::{BulletinError, BulletinResult};

/// Default storage key for the persisted read set
pub const DEFAULT_LEDGER_KEY: &str = "read_announcements";

/// Persisted set of read announcement ids
pub struct ReadLedger {
    medium: Arc<dyn PersistenceMedium>,
    key: String,
    ids: RwLock<BTreeSet<String>>,
    degraded: AtomicBool,
}

impl ReadLedger {
    /// Create a ledger backed by `medium` under the given key
    pub fn new(medium: Arc<dyn PersistenceMedium>, key: impl Into<String>) -> Self {
        Self {
            medium,
            key: key.into(),
            ids: RwLock::new(BTreeSet::new()),
            degraded: AtomicBool::new(false),
        }
    }

    /// Storage key used on the medium
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Check whether `id` has been marked read
    pub fn is_read(&self, id: &str) -> bool {
        self.ids
            .read()
            .map(|ids| ids.contains(id))
            .unwrap_or(false)
    }

    /// Copy of the in-memory read set
    pub fn read_ids(&self) -> BTreeSet<String> {
        self.ids.read().map(|ids| ids.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.ids.read().map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while the medium is failing and the ledger lives in memory only
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Restore the persisted set and merge it into memory
    ///
    /// Missing or corrupt data yields an empty set. If the medium cannot be
    /// read at all the ledger switches to memory-only mode and the error is
    /// returned so callers can surface it.
    pub async fn load(&self) -> BulletinResult<BTreeSet<String>> {
        let persisted = match self.read_persisted().await {
            Ok(persisted) => persisted,
            Err(e) => {
                self.enter_degraded(&e);
                return Err(e);
            }
        };

        self.merge(persisted.iter().cloned());
        info!(
            "Loaded {} read markers from '{}'",
            persisted.len(),
            self.key
        );
        Ok(persisted)
    }

    /// Mark a single announcement as read
    ///
    /// Returns true if the id was not read before. On a persistence failure
    /// the mark still holds in memory and the error is returned.
    pub async fn mark_read(&self, id: &str) -> BulletinResult<bool> {
        let added = self.merge(std::iter::once(id.to_string())) > 0;
        self.sync_to_medium().await?;
        Ok(added)
    }

    /// Mark every id in `ids` as read, keeping everything already read
    ///
    /// Returns how many ids were newly added.
    pub async fn mark_all_read<I>(&self, ids: I) -> BulletinResult<usize>
    where
        I: IntoIterator<Item = String>,
    {
        let added = self.merge(ids);
        self.sync_to_medium().await?;
        Ok(added)
    }

    /// Forget every read marker, in memory and on the medium
    pub async fn reset(&self) -> BulletinResult<()> {
        if let Ok(mut ids) = self.ids.write() {
            ids.clear();
        }
        self.medium.set(&self.key, "[]".to_string()).await?;
        info!("Reset read ledger '{}'", self.key);
        Ok(())
    }

    /// Re-read the medium, merge it, and write the union back if it differs
    async fn sync_to_medium(&self) -> BulletinResult<()> {
        let persisted = match self.read_persisted().await {
            Ok(persisted) => persisted,
            Err(e) => {
                // Writing blind would clobber marks made by other clients
                self.enter_degraded(&e);
                return Err(e);
            }
        };

        self.merge(persisted.iter().cloned());
        let merged = self.read_ids();

        if merged == persisted {
            self.leave_degraded();
            return Ok(());
        }

        let ids: Vec<&String> = merged.iter().collect();
        let serialized = serde_json::to_string(&ids)?;

        match self.medium.set(&self.key, serialized).await {
            Ok(()) => {
                debug!("Persisted {} read markers to '{}'", merged.len(), self.key);
                self.leave_degraded();
                Ok(())
            }
            Err(e) => {
                self.enter_degraded(&e);
                Err(e)
            }
        }
    }

    /// Read and parse the persisted set; corrupt data counts as empty
    async fn read_persisted(&self) -> BulletinResult<BTreeSet<String>> {
        let raw = self.medium.get(&self.key).await.map_err(|e| match e {
            BulletinError::PersistenceUnavailable { .. } => e,
            other => BulletinError::PersistenceUnavailable {
                message: other.to_string(),
            },
        })?;

        let Some(raw) = raw else {
            return Ok(BTreeSet::new());
        };

        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(ids) => Ok(ids.into_iter().collect()),
            Err(e) => {
                warn!(
                    "Ignoring corrupt read ledger under '{}', treating as empty: {}",
                    self.key, e
                );
                Ok(BTreeSet::new())
            }
        }
    }

    /// Add ids to the in-memory set, returning how many were new
    fn merge<I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        match self.ids.write() {
            Ok(mut set) => ids.into_iter().filter(|id| set.insert(id.clone())).count(),
            Err(_) => 0,
        }
    }

    fn enter_degraded(&self, err: &BulletinError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                "Read ledger '{}' falling back to memory only: {}",
                self.key, err
            );
        }
    }

    fn leave_degraded(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            info!("Read ledger '{}' persistence restored", self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn ledger_on(medium: &MemoryMedium) -> ReadLedger {
        ReadLedger::new(Arc::new(medium.clone()), DEFAULT_LEDGER_KEY)
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let medium = MemoryMedium::new();
        let ledger = ledger_on(&medium);

        assert!(ledger.mark_read("a").await.unwrap());
        assert!(!ledger.mark_read("a").await.unwrap());

        assert_eq!(ledger.len(), 1);
        assert_eq!(medium.raw(DEFAULT_LEDGER_KEY), Some(r#"["a"]"#.to_string()));
    }

    #[tokio::test]
    async fn test_mark_all_read_is_a_union() {
        let medium = MemoryMedium::new();
        let ledger = ledger_on(&medium);

        ledger.mark_read("a").await.unwrap();
        let added = ledger
            .mark_all_read(vec!["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();

        assert_eq!(added, 2);
        assert!(ledger.is_read("a"));
        assert!(ledger.is_read("b"));
        assert!(ledger.is_read("c"));
    }

    #[tokio::test]
    async fn test_load_missing_and_corrupt_fail_open() {
        let medium = MemoryMedium::new();
        let ledger = ledger_on(&medium);
        assert!(ledger.load().await.unwrap().is_empty());

        medium.put_raw(DEFAULT_LEDGER_KEY, "{not json");
        assert!(ledger.load().await.unwrap().is_empty());
        assert!(!ledger.is_degraded());
    }

    #[tokio::test]
    async fn test_load_restores_persisted_set() {
        let medium = MemoryMedium::new();
        medium.put_raw(DEFAULT_LEDGER_KEY, r#"["x","y"]"#);

        let ledger = ledger_on(&medium);
        ledger.load().await.unwrap();

        assert!(ledger.is_read("x"));
        assert!(ledger.is_read("y"));
        assert!(!ledger.is_read("z"));
    }

    #[tokio::test]
    async fn test_write_merges_other_clients_marks() {
        let medium = MemoryMedium::new();
        let first = ledger_on(&medium);
        let second = ledger_on(&medium);

        first.mark_read("a").await.unwrap();
        second.mark_read("b").await.unwrap();

        // The second write picked up the first client's mark instead of clobbering it
        let persisted: Vec<String> =
            serde_json::from_str(&medium.raw(DEFAULT_LEDGER_KEY).unwrap()).unwrap();
        assert_eq!(persisted, vec!["a".to_string(), "b".to_string()]);
        assert!(second.is_read("a"));
        assert!(!first.is_read("b"));
    }

    #[tokio::test]
    async fn test_unavailable_medium_keeps_memory_marks() {
        let medium = MemoryMedium::new();
        let ledger = ledger_on(&medium);
        medium.set_available(false);

        assert_err!(ledger.load().await);
        assert_err!(ledger.mark_read("a").await);
        assert!(ledger.is_degraded());
        assert!(ledger.is_read("a"));

        // Once the medium is back the next mark flushes everything held in memory
        medium.set_available(true);
        assert_ok!(ledger.mark_read("b").await);
        assert!(!ledger.is_degraded());
        assert_eq!(
            medium.raw(DEFAULT_LEDGER_KEY),
            Some(r#"["a","b"]"#.to_string())
        );
    }

    #[tokio::test]
    async fn test_reads_never_flip_back_to_unread() {
        let medium = MemoryMedium::new();
        let ledger = ledger_on(&medium);
        ledger.mark_read("a").await.unwrap();

        // Another client wipes the stored value; a reload merges rather than replaces
        medium.put_raw(DEFAULT_LEDGER_KEY, "[]");
        ledger.load().await.unwrap();
        assert!(ledger.is_read("a"));

        ledger.mark_read("b").await.unwrap();
        assert!(ledger.is_read("a"));
    }

    #[tokio::test]
    async fn test_reset_clears_memory_and_medium() {
        let medium = MemoryMedium::new();
        let ledger = ledger_on(&medium);
        ledger.mark_read("a").await.unwrap();

        ledger.reset().await.unwrap();

        assert!(ledger.is_empty());
        assert_eq!(medium.raw(DEFAULT_LEDGER_KEY), Some("[]".to_string()));
    }
}
