use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::announcement::{Announcement, Audience};
use crate::{BulletinError, BulletinResult};

/// Bulk query against the external announcement store
#[async_trait]
pub trait AnnouncementSource: Send + Sync {
    /// Fetch every announcement visible to `audience`
    ///
    /// Results should be newest first; the cache re-sorts either way.
    async fn query_announcements(&self, audience: Audience) -> BulletinResult<Vec<Announcement>>;
}

/// In-process announcement store
///
/// Clones share the same rows. Useful as a stand-in for the real store in
/// demos and tests.
#[derive(Clone, Default)]
pub struct MemorySource {
    rows: Arc<RwLock<Vec<Announcement>>>,
    failing: Arc<AtomicBool>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<Announcement>) -> Self {
        let source = Self::new();
        source.replace(rows);
        source
    }

    /// Insert or replace a row
    pub fn upsert(&self, row: Announcement) {
        if let Ok(mut rows) = self.rows.write() {
            rows.retain(|existing| existing.id != row.id);
            rows.push(row);
        }
    }

    pub fn remove(&self, id: &str) {
        if let Ok(mut rows) = self.rows.write() {
            rows.retain(|existing| existing.id != id);
        }
    }

    pub fn replace(&self, new_rows: Vec<Announcement>) {
        if let Ok(mut rows) = self.rows.write() {
            *rows = new_rows;
        }
    }

    /// Make queries fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

#[async_trait]
impl AnnouncementSource for MemorySource {
    async fn query_announcements(&self, audience: Audience) -> BulletinResult<Vec<Announcement>> {
        if self.failing.load(Ordering::Acquire) {
            return Err(BulletinError::FetchFailed {
                message: "announcement store unavailable".to_string(),
            });
        }

        let rows = self
            .rows
            .read()
            .map_err(|e| BulletinError::Internal(e.to_string()))?;

        let mut matching: Vec<Announcement> = rows
            .iter()
            .filter(|row| audience.admits(row.audience))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_query_scopes_by_audience() {
        let at = |h| Utc.with_ymd_and_hms(2024, 6, 3, h, 0, 0).unwrap();
        let source = MemorySource::with_rows(vec![
            Announcement::new("everyone", "Holiday", Audience::All, at(8)),
            Announcement::new("staff", "Staff meeting", Audience::Teacher, at(9)),
            Announcement::new("pupils", "Lockers", Audience::Student, at(10)),
        ]);

        let student = source.query_announcements(Audience::Student).await.unwrap();
        let ids: Vec<&str> = student.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["pupils", "everyone"]);

        let all = source.query_announcements(Audience::All).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_failing_source() {
        let source = MemorySource::new();
        source.set_failing(true);

        assert!(matches!(
            source.query_announcements(Audience::All).await,
            Err(BulletinError::FetchFailed { .. })
        ));
    }
}
