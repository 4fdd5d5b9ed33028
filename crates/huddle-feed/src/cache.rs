use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use huddle_types::models::Message;

/// Cached message list for one channel.
#[derive(Debug, Clone)]
struct CacheEntry {
    messages: Vec<Message>,
    written_at: Instant,
    valid: bool,
}

/// Per-channel message cache with a freshness TTL.
///
/// Invalidation only flips the validity flag; the stored list is kept until
/// the next write replaces it.
#[derive(Debug)]
pub struct MessageCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MessageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        // Entries are plain data, a panic mid-mutation cannot leave them torn.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn usable(&self, entry: &CacheEntry) -> bool {
        entry.valid && entry.written_at.elapsed() < self.ttl
    }

    pub fn is_valid(&self, channel_id: &str) -> bool {
        self.entries()
            .get(channel_id)
            .is_some_and(|entry| self.usable(entry))
    }

    /// Copy of the channel's list, or `None` on a miss (absent, invalidated or expired).
    pub fn read(&self, channel_id: &str) -> Option<Vec<Message>> {
        let entries = self.entries();
        let entry = entries.get(channel_id)?;
        if !self.usable(entry) {
            trace!(channel_id, "cache miss (stale)");
            return None;
        }
        Some(entry.messages.clone())
    }

    pub fn write(&self, channel_id: &str, messages: &[Message]) {
        self.entries().insert(
            channel_id.to_string(),
            CacheEntry {
                messages: messages.to_vec(),
                written_at: Instant::now(),
                valid: true,
            },
        );
    }

    pub fn invalidate(&self, channel_id: &str) {
        if let Some(entry) = self.entries().get_mut(channel_id) {
            entry.valid = false;
        }
    }

    /// Replace the message by id or insert it in creation order.
    /// No-op unless the channel has a usable entry.
    pub fn upsert(&self, channel_id: &str, message: &Message) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(channel_id) else {
            return;
        };
        if !self.usable(entry) {
            return;
        }

        match entry.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => {
                entry.messages.push(message.clone());
                entry.messages.sort_by_key(|m| m.created_at);
            }
        }
        entry.written_at = Instant::now();
    }

    pub fn remove(&self, channel_id: &str, message_id: &str) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(channel_id) else {
            return;
        };
        if !self.usable(entry) {
            return;
        }
        entry.messages.retain(|m| m.id != message_id);
    }
}
