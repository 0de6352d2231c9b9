use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::FeedChannel;
use crate::announcement::Audience;
use crate::protocol::FeedFrame;
use crate::{BulletinError, BulletinResult};

/// Feed channel backed by a WebSocket endpoint
///
/// Each connect opens a socket to `<url>?audience=<audience>` and forwards
/// text and binary messages as frames until the socket closes.
pub struct WsFeedChannel {
    url: String,
    buffer: usize,
}

impl WsFeedChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            buffer: 256,
        }
    }

    /// Set how many frames may queue before the socket reader waits
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    fn endpoint(&self, audience: Audience) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}audience={}", self.url, separator, audience)
    }
}

#[async_trait]
impl FeedChannel for WsFeedChannel {
    async fn connect(&self, audience: Audience) -> BulletinResult<mpsc::Receiver<FeedFrame>> {
        let endpoint = self.endpoint(audience);
        let (mut socket, _) =
            connect_async(endpoint.as_str())
                .await
                .map_err(|e| BulletinError::SubscriptionLost {
                    message: format!("Failed to connect to {}: {}", endpoint, e),
                })?;

        info!("Connected to announcement feed at {}", endpoint);

        let (tx, rx) = mpsc::channel(self.buffer);
        tokio::spawn(async move {
            while let Some(message) = socket.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => FeedFrame::Text(text),
                    Ok(Message::Binary(data)) => FeedFrame::Binary(data),
                    Ok(Message::Close(_)) => {
                        debug!("Feed socket {} closed by server", endpoint);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Feed socket {} error: {}", endpoint, e);
                        break;
                    }
                };

                if tx.send(frame).await.is_err() {
                    debug!("Feed receiver for {} dropped", endpoint);
                    break;
                }
            }
        });

        Ok(rx)
    }
}
