use serde::{Deserialize, Serialize};

use crate::announcement::{Announcement, AnnouncementPatch, Audience};
use crate::engine::SyncState;
use crate::BulletinError;

/// A decoded event from the real-time announcement feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum FeedEvent {
    /// A new announcement row
    Create(Announcement),
    /// Some fields of an existing row changed
    Update(AnnouncementPatch),
    /// A row was deleted
    Delete { id: String },
}

impl FeedEvent {
    /// Id of the announcement this event concerns
    pub fn id(&self) -> &str {
        match self {
            FeedEvent::Create(item) => &item.id,
            FeedEvent::Update(patch) => &patch.id,
            FeedEvent::Delete { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FeedEvent::Create(_) => "create",
            FeedEvent::Update(_) => "update",
            FeedEvent::Delete { .. } => "delete",
        }
    }
}

/// A raw frame as delivered by a feed transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFrame {
    /// Plain JSON text
    Text(String),
    /// lib0-framed JSON string
    Binary(Vec<u8>),
}

/// Decode a feed frame into an event
///
/// Any malformed frame yields `BulletinError::DecodeFailed`.
pub fn decode_frame(frame: &FeedFrame) -> crate::BulletinResult<FeedEvent> {
    let decoded = match frame {
        FeedFrame::Text(text) => serde_json::from_str(text).map_err(BulletinError::from),
        FeedFrame::Binary(data) => decode_message(data),
    };

    decoded.map_err(|e| BulletinError::DecodeFailed {
        message: e.to_string(),
    })
}

/// Messages sent from a presentation client to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Mark one announcement as read
    MarkRead { id: String },
    /// Mark everything currently listed as read
    MarkAllRead,
    /// Re-run the bulk fetch for the served audience
    ///
    /// A client may name the audience it expects; a mismatch is rejected.
    Refresh { audience: Option<Audience> },
}

/// Messages sent from the server to a presentation client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Current announcement list and unread count
    State { state: SyncState },
    /// Error message
    Error { message: String },
}

/// Encode a message using lib0 format
pub fn encode_message<T: Serialize>(message: &T) -> crate::BulletinResult<Vec<u8>> {
    let json = serde_json::to_string(message)?;
    let mut encoder = Vec::new();
    lib0::encoding::Write::write_string(&mut encoder, &json);
    Ok(encoder)
}

/// Decode a message from lib0 format
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> crate::BulletinResult<T> {
    let mut decoder = lib0::decoding::Cursor::new(data);
    let json = lib0::decoding::Read::read_string(&mut decoder).map_err(|e| {
        BulletinError::Protocol {
            message: format!("Failed to decode lib0 string: {}", e),
        }
    })?;

    let message = serde_json::from_str(json)?;
    Ok(message)
}
