use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use super::FeedChannel;
use crate::announcement::Audience;
use crate::protocol::{FeedEvent, FeedFrame};
use crate::{BulletinError, BulletinResult};

struct MemoryFeedInner {
    senders: Mutex<Vec<mpsc::Sender<FeedFrame>>>,
    connects: AtomicUsize,
    refusing: AtomicBool,
    buffer: usize,
}

/// In-process feed channel
///
/// Clones share the same set of connections. Frames published here reach
/// every connected receiver; `disconnect` drops them all, which subscribers
/// see as a transport loss.
#[derive(Clone)]
pub struct MemoryFeed {
    inner: Arc<MemoryFeedInner>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::with_buffer(256)
    }

    /// Create a feed whose connections buffer up to `buffer` frames
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(MemoryFeedInner {
                senders: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                refusing: AtomicBool::new(false),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Deliver a raw frame to every open connection
    ///
    /// Returns how many connections received it.
    pub fn publish(&self, frame: FeedFrame) -> usize {
        let Ok(mut senders) = self.inner.senders.lock() else {
            return 0;
        };

        senders.retain(|sender| !sender.is_closed());

        let mut delivered = 0;
        for sender in senders.iter() {
            match sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Memory feed dropped a frame: {}", e),
            }
        }
        delivered
    }

    /// Serialize an event as JSON text and publish it
    pub fn publish_event(&self, event: &FeedEvent) -> BulletinResult<usize> {
        let json = serde_json::to_string(event)?;
        Ok(self.publish(FeedFrame::Text(json)))
    }

    /// Close every open connection
    pub fn disconnect(&self) {
        if let Ok(mut senders) = self.inner.senders.lock() {
            debug!("Memory feed closing {} connections", senders.len());
            senders.clear();
        }
    }

    /// Refuse (or accept again) new connections
    pub fn set_refusing(&self, refusing: bool) {
        self.inner.refusing.store(refusing, Ordering::Release);
    }

    /// Total number of successful connects so far
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::Acquire)
    }

    /// Number of connections that are still open
    pub fn open_connections(&self) -> usize {
        self.inner
            .senders
            .lock()
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeedChannel for MemoryFeed {
    async fn connect(&self, audience: Audience) -> BulletinResult<mpsc::Receiver<FeedFrame>> {
        if self.inner.refusing.load(Ordering::Acquire) {
            return Err(BulletinError::SubscriptionLost {
                message: "memory feed refused the connection".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.inner
            .senders
            .lock()
            .map_err(|e| BulletinError::Internal(e.to_string()))?
            .push(tx);
        self.inner.connects.fetch_add(1, Ordering::AcqRel);

        debug!("Memory feed accepted connection for audience '{}'", audience);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_connections() {
        let feed = MemoryFeed::new();
        let mut first = feed.connect(Audience::All).await.unwrap();
        let mut second = feed.connect(Audience::Student).await.unwrap();

        let frame = FeedFrame::Text("{}".to_string());
        assert_eq!(feed.publish(frame.clone()), 2);

        assert_eq!(first.recv().await, Some(frame.clone()));
        assert_eq!(second.recv().await, Some(frame));
        assert_eq!(feed.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_closes_receivers() {
        let feed = MemoryFeed::new();
        let mut rx = feed.connect(Audience::All).await.unwrap();

        feed.disconnect();

        assert_eq!(rx.recv().await, None);
        assert_eq!(feed.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_refusing_feed() {
        let feed = MemoryFeed::new();
        feed.set_refusing(true);

        assert!(feed.connect(Audience::All).await.is_err());
        assert_eq!(feed.connect_count(), 0);
    }
}
