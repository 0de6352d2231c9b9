use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::{BulletinError, BulletinResult};

/// Key-value string store that survives restarts
///
/// Several engines may share one medium (one per open client), with no
/// coordination beyond whole-value last-write-wins.
#[async_trait]
pub trait PersistenceMedium: Send + Sync {
    /// Read the value stored under `key`, if any
    async fn get(&self, key: &str) -> BulletinResult<Option<String>>;

    /// Store `value` under `key`, replacing what was there
    async fn set(&self, key: &str, value: String) -> BulletinResult<()>;
}

/// Shared in-process medium
///
/// Clones share the same storage, which models several clients of one origin.
#[derive(Clone, Default)]
pub struct MemoryMedium {
    entries: Arc<Mutex<HashMap<String, String>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read and write fail (or succeed again)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
    }

    /// Raw stored value, bypassing availability
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
    }

    /// Overwrite a raw value, bypassing availability
    pub fn put_raw(&self, key: &str, value: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.into());
        }
    }

    fn check_available(&self) -> BulletinResult<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(BulletinError::PersistenceUnavailable {
                message: "memory medium is offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceMedium for MemoryMedium {
    async fn get(&self, key: &str) -> BulletinResult<Option<String>> {
        self.check_available()?;
        let entries = self
            .entries
            .lock()
            .map_err(|e| BulletinError::Internal(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> BulletinResult<()> {
        self.check_available()?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| BulletinError::Internal(e.to_string()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_clones_share_storage() {
        let first = MemoryMedium::new();
        let second = first.clone();

        assert_ok!(first.set("k", "v".to_string()).await);
        assert_eq!(second.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_unavailable_medium_fails() {
        let medium = MemoryMedium::new();
        medium.set_available(false);

        assert_err!(medium.get("k").await);
        assert_err!(medium.set("k", "v".to_string()).await);

        medium.set_available(true);
        assert_ok!(medium.set("k", "v".to_string()).await);
    }
}
