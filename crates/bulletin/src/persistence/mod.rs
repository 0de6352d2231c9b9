use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::ledger::PersistenceMedium;
use crate::{BulletinError, BulletinResult};

/// File extension used for stored values
const FILE_EXTENSION: &str = "ledger";

/// Persistence medium that keeps one file per key in a directory
///
/// Values are written to a temporary file and renamed into place, so a
/// concurrent reader sees either the old or the new value, never a torn one.
pub struct FileMedium {
    storage_path: PathBuf,
}

impl FileMedium {
    /// Create a file medium rooted at `storage_path`
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }

    /// Create the storage directory if it does not exist yet
    pub async fn open(storage_path: impl Into<PathBuf>) -> BulletinResult<Self> {
        let medium = Self::new(storage_path);
        tokio::fs::create_dir_all(&medium.storage_path).await?;
        info!(
            "Opened file persistence medium at {:?}",
            medium.storage_path
        );
        Ok(medium)
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn file_path(&self, key: &str) -> BulletinResult<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(BulletinError::PersistenceUnavailable {
                message: format!("Invalid storage key '{}'", key),
            });
        }
        Ok(self
            .storage_path
            .join(format!("{}.{}", key, FILE_EXTENSION)))
    }
}

#[async_trait]
impl PersistenceMedium for FileMedium {
    async fn get(&self, key: &str) -> BulletinResult<Option<String>> {
        let file_path = self.file_path(key)?;

        match tokio::fs::read_to_string(&file_path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BulletinError::PersistenceUnavailable {
                message: format!("Failed to read {:?}: {}", file_path, e),
            }),
        }
    }

    async fn set(&self, key: &str, value: String) -> BulletinResult<()> {
        let file_path = self.file_path(key)?;
        let tmp_path = file_path.with_extension(format!(
            "{}.{}.tmp",
            FILE_EXTENSION,
            uuid::Uuid::new_v4().simple()
        ));

        let write = async {
            tokio::fs::write(&tmp_path, value).await?;
            tokio::fs::rename(&tmp_path, &file_path).await
        };

        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(BulletinError::PersistenceUnavailable {
                message: format!("Failed to write {:?}: {}", file_path, e),
            });
        }

        debug!("Wrote key '{}' to {:?}", key, file_path);
        Ok(())
    }
}
