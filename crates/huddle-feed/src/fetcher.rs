use std::sync::Arc;

use tracing::{debug, warn};

use huddle_types::models::{Message, Reaction};

use crate::cache::MessageCache;
use crate::error::SourceError;
use crate::source::MessageSource;

/// Read-through access to channel messages.
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn MessageSource>,
    cache: Arc<MessageCache>,
    limit: usize,
}

impl Fetcher {
    pub fn new(source: Arc<dyn MessageSource>, cache: Arc<MessageCache>, limit: usize) -> Self {
        Self { source, cache, limit }
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    /// Messages of a channel, oldest first.
    ///
    /// With `use_cache` a valid cache entry is returned without touching the
    /// network. Otherwise the backend is queried, rows from other channels
    /// are dropped, and the result replaces the cache entry.
    pub async fn fetch_channel_messages(&self, channel_id: &str, use_cache: bool) -> Result<Vec<Message>, SourceError> {
        if use_cache {
            if let Some(cached) = self.cache.read(channel_id) {
                debug!(channel_id, count = cached.len(), "Serving messages from cache");
                return Ok(cached);
            }
        }

        let fetched = self.source.list_messages(channel_id, self.limit).await?;
        let total = fetched.len();

        let mut messages: Vec<Message> = fetched
            .into_iter()
            .filter(|m| {
                let matches = m.channel_id == channel_id;
                if !matches {
                    warn!(
                        channel_id,
                        message_id = %m.id,
                        message_channel = %m.channel_id,
                        "Dropping message from another channel"
                    );
                }
                matches
            })
            .collect();
        messages.sort_by_key(|m| m.created_at);

        debug!(channel_id, kept = messages.len(), total, "Fetched channel messages");
        self.cache.write(channel_id, &messages);
        Ok(messages)
    }

    /// One message with profile and reactions. Failures are logged and
    /// reported as `None`.
    pub async fn fetch_one_message(&self, message_id: &str) -> Option<Message> {
        match self.source.get_message(message_id).await {
            Ok(Some(message)) => Some(message),
            Ok(None) => {
                debug!(message_id, "Message not found");
                None
            }
            Err(e) => {
                warn!(message_id, "Failed to fetch message: {}", e);
                None
            }
        }
    }

    /// Current reaction set of a message. Failures are logged and reported as `None`.
    pub async fn fetch_reactions(&self, message_id: &str) -> Option<Vec<Reaction>> {
        match self.source.list_reactions(message_id).await {
            Ok(reactions) => Some(reactions),
            Err(e) => {
                warn!(message_id, "Failed to fetch reactions: {}", e);
                None
            }
        }
    }
}
