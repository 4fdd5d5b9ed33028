//! Seams to the hosted backend: table queries, realtime change streams and
//! the signed-in identity.

use async_trait::async_trait;
use tokio::sync::mpsc;

use huddle_types::events::{ChangeEvent, Topic};
use huddle_types::models::{Message, NewMessage, Profile, Reaction};

use crate::error::SourceError;

/// Query access to the `messages` and `message_reactions` tables.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// The `limit` most recent messages of a channel, oldest first, with
    /// author profile and reactions attached.
    async fn list_messages(&self, channel_id: &str, limit: usize) -> Result<Vec<Message>, SourceError>;

    /// A single message with profile and reactions. `Ok(None)` if it does not exist.
    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, SourceError>;

    async fn list_reactions(&self, message_id: &str) -> Result<Vec<Reaction>, SourceError>;

    /// Insert a message and return the stored row.
    async fn insert_message(&self, message: &NewMessage) -> Result<Message, SourceError>;

    /// Remove the reaction if present, otherwise add it.
    /// Returns `true` when the reaction was added.
    async fn toggle_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<bool, SourceError>;
}

/// Realtime change feed.
#[async_trait]
pub trait RealtimeSource: Send + Sync {
    async fn subscribe(&self, topic: Topic) -> Result<Subscription, SourceError>;
}

#[async_trait]
pub trait Identity: Send + Sync {
    /// Profile of the signed-in user, `None` when signed out.
    async fn current_user(&self) -> Result<Option<Profile>, SourceError>;
}

/// A live realtime subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    guard: SubscriptionGuard,
}

impl Subscription {
    pub fn new(topic: Topic, events: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self {
            topic,
            events,
            guard: SubscriptionGuard { on_drop: None },
        }
    }

    /// Run `f` when the subscription is dropped, e.g. to leave the topic upstream.
    pub fn on_drop<F>(mut self, f: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.guard.on_drop = Some(Box::new(f));
        self
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Separate the event stream from the unsubscribe guard, so the stream
    /// can be drained on another task while the owner keeps control over
    /// when the subscription ends.
    pub fn split(self) -> (SubscriptionGuard, mpsc::UnboundedReceiver<ChangeEvent>) {
        (self.guard, self.events)
    }
}

/// Ends a subscription when dropped.
pub struct SubscriptionGuard {
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("armed", &self.on_drop.is_some())
            .finish()
    }
}
