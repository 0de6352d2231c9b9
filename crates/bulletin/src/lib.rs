//! # Bulletin - Announcement delivery and read-state sync
//!
//! Keeps a per-client cache of announcements current from a bulk query and a
//! real-time feed, tracks which announcements the local user has read in a
//! persisted ledger, and derives an always-consistent unread count.
//!
//! Several engines (one per open client) may share a persistence medium; the
//! ledger is the only state they share.

pub mod announcement;
pub mod cache;
pub mod engine;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod protocol;
pub mod source;

#[cfg(feature = "persistence")]
pub mod persistence;

#[cfg(feature = "axum")]
pub mod axum;

// Re-exports for convenience
pub use announcement::{Announcement, AnnouncementPatch, Audience};
pub use cache::AnnouncementCache;
pub use engine::{AnnouncementView, EngineConfig, EnginePhase, SyncEngine, SyncState};
pub use error::{BulletinError, BulletinResult, FaultKind, SyncFault};
pub use feed::{FeedChannel, FeedSubscriber, MemoryFeed, Subscription};
pub use ledger::{MemoryMedium, PersistenceMedium, ReadLedger};
pub use protocol::{ClientMessage, FeedEvent, FeedFrame, ServerMessage};
pub use source::{AnnouncementSource, MemorySource};

#[cfg(feature = "feed-ws")]
pub use feed::WsFeedChannel;

#[cfg(feature = "axum")]
pub use self::axum::{router_with_engine, router_with_state, BulletinState, WebSocketHandler};

#[cfg(feature = "persistence")]
pub use persistence::FileMedium;
