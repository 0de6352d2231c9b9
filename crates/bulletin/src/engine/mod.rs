//! Sync engine
//!
//! The engine owns the announcement cache and the read ledger and is the
//! only thing that mutates them. After every mutation it rebuilds the
//! [`SyncState`] and publishes it on a watch channel, so the unread count a
//! consumer sees is always derived from the list next to it.
//!
//! Public operations never return errors. Failures are recorded as a
//! [`SyncFault`] on the state and the last good data stays in place.

pub mod config;
pub mod state;

pub use config::EngineConfig;
pub use state::{AnnouncementView, EnginePhase, SyncState};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::announcement::Audience;
use crate::cache::AnnouncementCache;
use crate::error::{FaultKind, SyncFault};
use crate::feed::{FeedChannel, FeedSubscriber, Subscription};
use crate::ledger::{PersistenceMedium, ReadLedger};
use crate::protocol::FeedEvent;
use crate::source::AnnouncementSource;
use crate::BulletinError;

/// Phase, fault and fetch bookkeeping, guarded together with every cache mutation
struct Control {
    phase: EnginePhase,
    /// Open faults; each kind is cleared only by a success of that kind
    faults: BTreeMap<FaultKind, SyncFault>,
    /// Ticket of the newest fetch whose data is in the cache
    applied_ticket: u64,
    /// Fetches started and not yet finished or dropped
    in_flight: usize,
    has_data: bool,
}

struct EngineInner {
    id: String,
    config: EngineConfig,
    source: Arc<dyn AnnouncementSource>,
    feed: Arc<dyn FeedChannel>,
    cache: AnnouncementCache,
    ledger: ReadLedger,
    control: Mutex<Control>,
    ledger_loaded: AtomicBool,
    fetch_tickets: AtomicU64,
    state_tx: watch::Sender<SyncState>,
}

/// Announcement cache and read-state orchestrator
///
/// Cloning is cheap; clones share the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create an engine with the default configuration
    pub fn new(
        source: Arc<dyn AnnouncementSource>,
        feed: Arc<dyn FeedChannel>,
        medium: Arc<dyn PersistenceMedium>,
    ) -> Self {
        Self::with_config(source, feed, medium, EngineConfig::default())
    }

    /// Create an engine with an explicit configuration
    pub fn with_config(
        source: Arc<dyn AnnouncementSource>,
        feed: Arc<dyn FeedChannel>,
        medium: Arc<dyn PersistenceMedium>,
        config: EngineConfig,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let ledger = ReadLedger::new(medium, config.ledger_key.clone());
        let (state_tx, _) = watch::channel(SyncState::default());

        info!("Creating sync engine {}", id);

        Self {
            inner: Arc::new(EngineInner {
                id,
                config,
                source,
                feed,
                cache: AnnouncementCache::new(),
                ledger,
                control: Mutex::new(Control {
                    phase: EnginePhase::Idle,
                    faults: BTreeMap::new(),
                    applied_ticket: 0,
                    in_flight: 0,
                    has_data: false,
                }),
                ledger_loaded: AtomicBool::new(false),
                fetch_tickets: AtomicU64::new(0),
                state_tx,
            }),
        }
    }

    /// Engine instance id, used to correlate log lines
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &AnnouncementCache {
        &self.inner.cache
    }

    pub fn ledger(&self) -> &ReadLedger {
        &self.inner.ledger
    }

    /// Last published state
    pub fn state(&self) -> SyncState {
        self.inner.state_tx.borrow().clone()
    }

    /// Receiver that is notified every time the state changes
    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.inner.state_tx.subscribe()
    }

    pub fn phase(&self) -> EnginePhase {
        self.lock_control().phase
    }

    /// Bulk-load announcements for `audience` and replace the cache
    ///
    /// Only the newest fetch to complete is applied; an older fetch that
    /// finishes later is discarded. On failure the previous list is kept and
    /// a fetch fault is recorded.
    ///
    /// If the returned future is dropped before it completes and no other
    /// fetch is running, a `Loading` phase falls back to `Idle`.
    pub async fn fetch(&self, audience: Audience) -> SyncState {
        let ticket = self.inner.fetch_tickets.fetch_add(1, Ordering::AcqRel) + 1;

        let _in_flight = {
            let mut control = self.lock_control();
            control.in_flight += 1;
            if control.phase == EnginePhase::Idle {
                control.phase = EnginePhase::Loading;
                self.publish(&control);
            }
            InFlightFetch { engine: self }
        };

        debug!(
            "Engine {} starting fetch #{} for audience '{}'",
            self.inner.id, ticket, audience
        );

        if !self.inner.ledger_loaded.load(Ordering::Acquire) {
            self.load_ledger().await;
        }

        let result = self.inner.source.query_announcements(audience).await;

        let mut control = self.lock_control();

        if ticket <= control.applied_ticket {
            debug!(
                "Engine {} discarding fetch #{}, newer fetch #{} already applied",
                self.inner.id, ticket, control.applied_ticket
            );
            return self.publish(&control);
        }

        match result {
            Ok(items) => {
                let count = items.len();
                self.inner.cache.load_initial(items);
                control.applied_ticket = ticket;
                control.has_data = true;
                control.phase = EnginePhase::Ready;
                clear_fault(&mut control, FaultKind::Fetch);
                info!(
                    "Engine {} loaded {} announcements for audience '{}'",
                    self.inner.id, count, audience
                );
            }
            Err(e) => {
                let err = match e {
                    BulletinError::FetchFailed { .. } => e,
                    other => BulletinError::FetchFailed {
                        message: other.to_string(),
                    },
                };
                error!("Engine {} fetch #{} failed: {}", self.inner.id, ticket, err);
                record(&mut control, &err);
                if !control.has_data {
                    control.phase = EnginePhase::Idle;
                }
            }
        }

        self.publish(&control)
    }

    /// Mark one announcement as read
    ///
    /// Ids that are not cached are still recorded, for when they show up.
    pub async fn mark_read(&self, id: &str) -> SyncState {
        let result = self.inner.ledger.mark_read(id).await;

        let mut control = self.lock_control();
        match result {
            Ok(added) => {
                debug!(
                    "Engine {} marked '{}' read (new: {})",
                    self.inner.id, id, added
                );
                clear_fault(&mut control, FaultKind::Persistence);
            }
            Err(e) => record(&mut control, &e),
        }
        self.publish(&control)
    }

    /// Mark every currently cached announcement as read
    pub async fn mark_all_read(&self) -> SyncState {
        // Cache replacement runs under the control lock, so this never sees a half-loaded cache
        let ids = {
            let _control = self.lock_control();
            self.inner.cache.ids()
        };
        let result = self.inner.ledger.mark_all_read(ids).await;

        let mut control = self.lock_control();
        match result {
            Ok(added) => {
                info!(
                    "Engine {} marked all read ({} newly read)",
                    self.inner.id, added
                );
                clear_fault(&mut control, FaultKind::Persistence);
            }
            Err(e) => record(&mut control, &e),
        }
        self.publish(&control)
    }

    /// Start following the feed for `audience`
    ///
    /// Dropping or unsubscribing the returned handle stops the subscription.
    pub fn subscribe(&self, audience: Audience) -> Subscription {
        info!(
            "Engine {} subscribing to feed for audience '{}'",
            self.inner.id, audience
        );
        FeedSubscriber::spawn(self.clone(), self.inner.feed.clone(), audience)
    }

    /// Apply one feed event to the cache and republish
    ///
    /// Returns None without touching the cache if `cancelled` is set.
    pub(crate) fn apply_event(
        &self,
        event: FeedEvent,
        audience: Audience,
        cancelled: &AtomicBool,
    ) -> Option<SyncState> {
        let mut control = self.lock_control();

        if cancelled.load(Ordering::Acquire) {
            debug!(
                "Engine {} discarding {} event for '{}' from a closed subscription",
                self.inner.id,
                event.kind(),
                event.id()
            );
            return None;
        }

        let cache = &self.inner.cache;
        let changed = match event {
            FeedEvent::Create(item) => {
                if audience.admits(item.audience) {
                    cache.apply_create(item)
                } else {
                    debug!(
                        "Ignoring create for '{}' outside audience '{}'",
                        item.id, audience
                    );
                    false
                }
            }
            FeedEvent::Update(patch) => cache.apply_update(&patch),
            FeedEvent::Delete { id } => cache.apply_delete(&id),
        };

        clear_fault(&mut control, FaultKind::Decode);
        let state = self.publish(&control);
        if changed {
            debug!(
                "Engine {} applied feed event, {} unread",
                self.inner.id,
                state.unread_count()
            );
        }
        Some(state)
    }

    /// Record a fault raised outside the public operations
    pub(crate) fn report(&self, err: &BulletinError) {
        let mut control = self.lock_control();
        record(&mut control, err);
        self.publish(&control);
    }

    pub(crate) fn resolve(&self, kind: FaultKind) {
        let mut control = self.lock_control();
        if clear_fault(&mut control, kind) {
            self.publish(&control);
        }
    }

    async fn load_ledger(&self) {
        match self.inner.ledger.load().await {
            Ok(_) => {
                self.inner.ledger_loaded.store(true, Ordering::Release);
                let mut control = self.lock_control();
                clear_fault(&mut control, FaultKind::Persistence);
            }
            Err(e) => {
                warn!(
                    "Engine {} could not load read ledger, all items unread: {}",
                    self.inner.id, e
                );
                let mut control = self.lock_control();
                record(&mut control, &e);
            }
        }
    }

    /// Rebuild the state from cache and ledger and publish it if it changed
    fn publish(&self, control: &Control) -> SyncState {
        let state = SyncState::derive(
            self.inner.cache.snapshot(),
            &self.inner.ledger,
            control.phase,
            control.faults.values().cloned(),
        );

        self.inner.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });

        state
    }

    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.inner
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Record `err`, replacing any open fault of the same kind
fn record(control: &mut Control, err: &BulletinError) {
    let fault = SyncFault::from(err);
    control.faults.insert(fault.kind, fault);
}

/// Clear the open fault of `kind`. Returns true if there was one.
fn clear_fault(control: &mut Control, kind: FaultKind) -> bool {
    control.faults.remove(&kind).is_some()
}

/// Counts a running fetch; dropping the last one while nothing is loaded yet
/// returns the phase to `Idle`
struct InFlightFetch<'a> {
    engine: &'a SyncEngine,
}

impl Drop for InFlightFetch<'_> {
    fn drop(&mut self) {
        let mut control = self.engine.lock_control();
        control.in_flight = control.in_flight.saturating_sub(1);
        if control.in_flight == 0 && control.phase == EnginePhase::Loading && !control.has_data {
            debug!(
                "Engine {} fetch abandoned before completing, back to idle",
                self.engine.inner.id
            );
            control.phase = EnginePhase::Idle;
            self.engine.publish(&control);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::announcement::Announcement;
    use crate::feed::MemoryFeed;
    use crate::ledger::MemoryMedium;
    use crate::source::MemorySource;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn announcement(id: &str, hour: u32, audience: Audience) -> Announcement {
        Announcement::new(
            id,
            format!("Notice {}", id),
            audience,
            Utc.with_ymd_and_hms(2024, 9, 2, hour, 0, 0).unwrap(),
        )
    }

    fn engine_with(source: &MemorySource, medium: &MemoryMedium) -> SyncEngine {
        SyncEngine::new(
            Arc::new(source.clone()),
            Arc::new(MemoryFeed::new()),
            Arc::new(medium.clone()),
        )
    }

    #[tokio::test]
    async fn test_phase_transitions() {
        let source = MemorySource::with_rows(vec![announcement("x", 8, Audience::All)]);
        let engine = engine_with(&source, &MemoryMedium::new());
        assert_eq!(engine.phase(), EnginePhase::Idle);

        let state = engine.fetch(Audience::All).await;
        assert_eq!(state.phase(), EnginePhase::Ready);
        assert_eq!(engine.phase(), EnginePhase::Ready);
        assert_eq!(engine.state(), state);
    }

    #[tokio::test]
    async fn test_first_fetch_failure_returns_to_idle() {
        let source = MemorySource::new();
        source.set_failing(true);
        let engine = engine_with(&source, &MemoryMedium::new());

        let state = engine.fetch(Audience::All).await;

        assert_eq!(state.phase(), EnginePhase::Idle);
        assert_eq!(state.fault().map(|f| f.kind), Some(FaultKind::Fetch));
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_last_good_list() {
        let source = MemorySource::with_rows(vec![
            announcement("x", 8, Audience::All),
            announcement("y", 9, Audience::All),
        ]);
        let engine = engine_with(&source, &MemoryMedium::new());
        engine.fetch(Audience::All).await;

        source.set_failing(true);
        let state = engine.fetch(Audience::All).await;

        assert_eq!(state.phase(), EnginePhase::Ready);
        assert_eq!(state.ids(), vec!["y", "x"]);
        assert_eq!(state.fault().map(|f| f.kind), Some(FaultKind::Fetch));

        // A later success clears the flag
        source.set_failing(false);
        let state = engine.fetch(Audience::All).await;
        assert!(state.fault().is_none());
    }

    #[tokio::test]
    async fn test_mark_read_unknown_id_is_recorded() {
        let source = MemorySource::with_rows(vec![announcement("x", 8, Audience::All)]);
        let engine = engine_with(&source, &MemoryMedium::new());
        engine.fetch(Audience::All).await;

        let state = engine.mark_read("later").await;
        assert_eq!(state.ids(), vec!["x"]);
        assert_eq!(state.unread_count(), 1);

        // When the id appears it is already read
        source.upsert(announcement("later", 9, Audience::All));
        let state = engine.fetch(Audience::All).await;
        assert_eq!(state.is_read("later"), Some(true));
        assert_eq!(state.unread_count(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_flagged_not_raised() {
        let source = MemorySource::with_rows(vec![announcement("x", 8, Audience::All)]);
        let medium = MemoryMedium::new();
        let engine = engine_with(&source, &medium);
        engine.fetch(Audience::All).await;

        medium.set_available(false);
        let state = engine.mark_read("x").await;

        assert_eq!(state.unread_count(), 0);
        assert_eq!(state.fault().map(|f| f.kind), Some(FaultKind::Persistence));
        assert!(engine.ledger().is_degraded());

        medium.set_available(true);
        let state = engine.mark_all_read().await;
        assert!(state.fault().is_none());
        assert_eq!(medium.raw("read_announcements"), Some(r#"["x"]"#.to_string()));
    }

    #[tokio::test]
    async fn test_unreadable_ledger_starts_everything_unread() {
        let source = MemorySource::with_rows(vec![announcement("x", 8, Audience::All)]);
        let medium = MemoryMedium::new();
        medium.put_raw("read_announcements", r#"["x"]"#);
        medium.set_available(false);
        let engine = engine_with(&source, &medium);

        let state = engine.fetch(Audience::All).await;
        assert_eq!(state.unread_count(), 1);
        assert_eq!(state.phase(), EnginePhase::Ready);

        // The ledger is retried on the next fetch once the medium is back
        medium.set_available(true);
        let state = engine.fetch(Audience::All).await;
        assert_eq!(state.unread_count(), 0);
        assert!(state.fault().is_none());
    }

    #[tokio::test]
    async fn test_watch_sees_updates() {
        let source = MemorySource::with_rows(vec![announcement("x", 8, Audience::All)]);
        let engine = engine_with(&source, &MemoryMedium::new());
        let mut rx = engine.watch();

        engine.fetch(Audience::All).await;
        engine.mark_read("x").await;

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().unread_count(), 0);
    }

    #[tokio::test]
    async fn test_persistence_fault_outlives_subscription_recovery() {
        let source = MemorySource::with_rows(vec![announcement("x", 8, Audience::All)]);
        let medium = MemoryMedium::new();
        let engine = engine_with(&source, &medium);
        engine.fetch(Audience::All).await;

        medium.set_available(false);
        engine.mark_read("x").await;

        engine.report(&BulletinError::SubscriptionLost {
            message: "feed connection closed".to_string(),
        });
        let state = engine.fetch(Audience::All).await;
        assert!(state.has_fault(FaultKind::Persistence));
        assert!(state.has_fault(FaultKind::Subscription));

        engine.resolve(FaultKind::Subscription);
        let state = engine.state();
        assert_eq!(state.fault().map(|f| f.kind), Some(FaultKind::Persistence));
        assert!(!state.has_fault(FaultKind::Subscription));
        assert!(engine.ledger().is_degraded());
    }

    #[tokio::test]
    async fn test_fetch_fault_outlives_decode_recovery() {
        let source = MemorySource::with_rows(vec![announcement("x", 8, Audience::All)]);
        let engine = engine_with(&source, &MemoryMedium::new());
        engine.fetch(Audience::All).await;

        source.set_failing(true);
        engine.fetch(Audience::All).await;
        engine.report(&BulletinError::DecodeFailed {
            message: "truncated frame".to_string(),
        });
        assert_eq!(engine.state().faults().len(), 2);

        let live = AtomicBool::new(false);
        let state = engine
            .apply_event(
                FeedEvent::Delete {
                    id: "x".to_string(),
                },
                Audience::All,
                &live,
            )
            .unwrap();
        assert!(state.is_empty());
        assert!(!state.has_fault(FaultKind::Decode));
        assert_eq!(state.fault().map(|f| f.kind), Some(FaultKind::Fetch));

        source.set_failing(false);
        let state = engine.fetch(Audience::All).await;
        assert!(state.faults().is_empty());
    }

    /// Source whose query never completes
    struct StalledSource;

    #[async_trait::async_trait]
    impl AnnouncementSource for StalledSource {
        async fn query_announcements(
            &self,
            _audience: Audience,
        ) -> crate::BulletinResult<Vec<Announcement>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_dropped_first_fetch_returns_to_idle() {
        let engine = SyncEngine::new(
            Arc::new(StalledSource),
            Arc::new(MemoryFeed::new()),
            Arc::new(MemoryMedium::new()),
        );

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), engine.fetch(Audience::All)).await;
        tokio_test::assert_err!(timed_out);

        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert_eq!(engine.state().phase(), EnginePhase::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mark_all_read_never_sees_partial_reload() {
        let rows: Vec<Announcement> = (0..20)
            .map(|hour| announcement(&format!("n{}", hour), hour, Audience::All))
            .collect();
        let source = MemorySource::with_rows(rows);
        let engine = engine_with(&source, &MemoryMedium::new());
        engine.fetch(Audience::All).await;

        let refresher = {
            let engine = engine.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    engine.fetch(Audience::All).await;
                }
            })
        };

        for _ in 0..200 {
            engine.ledger().reset().await.unwrap();
            let state = engine.mark_all_read().await;
            assert_eq!(engine.ledger().len(), 20);
            assert_eq!(state.unread_count(), 0);
        }

        refresher.await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_event_respects_cancel_and_audience() {
        let source = MemorySource::new();
        let engine = engine_with(&source, &MemoryMedium::new());
        let live = AtomicBool::new(false);
        let cancelled = AtomicBool::new(true);

        let created = FeedEvent::Create(announcement("t", 8, Audience::Teacher));
        let state = engine
            .apply_event(created.clone(), Audience::Student, &live)
            .unwrap();
        assert!(state.is_empty());

        assert!(engine
            .apply_event(created.clone(), Audience::Teacher, &cancelled)
            .is_none());
        assert!(engine.cache().is_empty());

        let state = engine
            .apply_event(created, Audience::Teacher, &live)
            .unwrap();
        assert_eq!(state.unread_count(), 1);
    }
}
