use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::FeedChannel;
use crate::announcement::Audience;
use crate::engine::SyncEngine;
use crate::error::FaultKind;
use crate::protocol::{decode_frame, FeedFrame};
use crate::BulletinError;

/// Background task that feeds one channel into one engine
///
/// Frames are handled strictly one after another. After the stream drops
/// the subscriber reconnects with exponential backoff and, once connected
/// again, forces a full fetch before applying any new event, since events
/// missed during the gap are never replayed.
pub struct FeedSubscriber {
    engine: SyncEngine,
    channel: Arc<dyn FeedChannel>,
    audience: Audience,
    cancelled: Arc<AtomicBool>,
}

impl FeedSubscriber {
    /// Start a subscriber task and return its handle
    pub fn spawn(
        engine: SyncEngine,
        channel: Arc<dyn FeedChannel>,
        audience: Audience,
    ) -> Subscription {
        let cancelled = Arc::new(AtomicBool::new(false));
        let subscriber = Self {
            engine,
            channel,
            audience,
            cancelled: cancelled.clone(),
        };

        let handle = tokio::spawn(subscriber.run());
        Subscription::new(audience, cancelled, handle)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    async fn run(self) {
        let engine_id = self.engine.id().to_string();
        let mut attempt: u32 = 0;
        let mut resync = false;

        info!(
            "Feed subscriber started for engine {} (audience '{}')",
            engine_id, self.audience
        );

        while !self.is_cancelled() {
            match self.channel.connect(self.audience).await {
                Ok(mut frames) => {
                    attempt = 0;

                    if resync {
                        info!("Feed reconnected for engine {}, resyncing", engine_id);
                        self.engine.fetch(self.audience).await;
                    }
                    self.engine.resolve(FaultKind::Subscription);

                    while let Some(frame) = frames.recv().await {
                        if self.is_cancelled() {
                            break;
                        }
                        self.handle_frame(frame);
                    }

                    if self.is_cancelled() {
                        break;
                    }

                    let err = BulletinError::SubscriptionLost {
                        message: "feed connection closed".to_string(),
                    };
                    warn!("Engine {}: {}", engine_id, err);
                    self.engine.report(&err);
                }
                Err(e) => {
                    let err = match e {
                        BulletinError::SubscriptionLost { .. } => e,
                        other => BulletinError::SubscriptionLost {
                            message: other.to_string(),
                        },
                    };
                    warn!("Engine {} could not connect to feed: {}", engine_id, err);
                    self.engine.report(&err);
                }
            }

            resync = true;
            let delay = self.engine.config().reconnect_delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(
                "Engine {} reconnecting to feed in {:?} (attempt {})",
                engine_id, delay, attempt
            );
            tokio::time::sleep(delay).await;
        }

        debug!("Feed subscriber for engine {} stopped", engine_id);
    }

    fn handle_frame(&self, frame: FeedFrame) {
        match decode_frame(&frame) {
            Ok(event) => {
                debug!(
                    "Engine {} received {} event for '{}'",
                    self.engine.id(),
                    event.kind(),
                    event.id()
                );
                self.engine.apply_event(event, self.audience, &self.cancelled);
            }
            Err(e) => {
                warn!("Engine {} dropping feed frame: {}", self.engine.id(), e);
                self.engine.report(&e);
            }
        }
    }
}

/// Handle to a running feed subscription
///
/// Unsubscribing is idempotent. Once `unsubscribe` resolves no further event
/// from this subscription reaches the cache. Dropping the handle cancels the
/// subscription as well.
pub struct Subscription {
    audience: Audience,
    cancelled: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    pub(crate) fn new(
        audience: Audience,
        cancelled: Arc<AtomicBool>,
        handle: JoinHandle<()>,
    ) -> Self {
        Self {
            audience,
            cancelled,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn audience(&self) -> Audience {
        self.audience
    }

    /// Check if the subscription has not been cancelled
    pub fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire)
    }

    /// Stop the subscription and wait for its task to finish
    pub async fn unsubscribe(&self) {
        self.cancelled.store(true, Ordering::Release);

        let handle = match self.handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let Some(handle) = handle else {
            return;
        };

        handle.abort();
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                error!("Feed subscriber task error: {}", e);
            }
        }
        info!("Unsubscribed from feed (audience '{}')", self.audience);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Cancel if not already unsubscribed
        self.cancelled.store(true, Ordering::Release);
        let handle = match self.handle.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
