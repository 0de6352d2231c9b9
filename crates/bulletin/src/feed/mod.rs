//! Real-time announcement feed
//!
//! A [`FeedChannel`] hands out a stream of raw frames per connection. The
//! [`FeedSubscriber`] decodes them and applies each event to the engine one
//! at a time, reconnecting with backoff when the stream ends.

pub mod memory;
pub mod subscriber;

#[cfg(feature = "feed-ws")]
pub mod ws;

pub use memory::MemoryFeed;
pub use subscriber::{FeedSubscriber, Subscription};

#[cfg(feature = "feed-ws")]
pub use ws::WsFeedChannel;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::announcement::Audience;
use crate::protocol::FeedFrame;
use crate::BulletinResult;

/// Source of real-time announcement events
///
/// Each call to `connect` opens a fresh connection. The returned receiver
/// closing means the transport disconnected.
#[async_trait]
pub trait FeedChannel: Send + Sync {
    async fn connect(&self, audience: Audience) -> BulletinResult<mpsc::Receiver<FeedFrame>>;
}
