//! In-memory backend used by the feed integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Notify, mpsc};

use huddle_feed::{FeedSources, Identity, MessageSource, RealtimeSource, SourceError, Subscription};
use huddle_types::events::{ChangeEvent, Topic};
use huddle_types::models::{Message, NewMessage, Profile, Reaction};

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

pub fn profile(id: &str) -> Profile {
    Profile {
        id: id.into(),
        username: format!("user-{}", id.to_lowercase()),
        full_name: None,
        avatar_url: None,
    }
}

pub fn message(id: &str, channel_id: &str, user_id: &str, secs: i64) -> Message {
    Message {
        id: id.into(),
        content: Some(format!("message {}", id)),
        image_url: None,
        channel_id: channel_id.into(),
        user_id: user_id.into(),
        created_at: at(secs),
        updated_at: at(secs),
        parent_id: None,
        client_token: None,
        profile: Some(profile(user_id)),
        reactions: vec![],
    }
}

pub fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.clone()).collect()
}

/// Let spawned tasks run until `cond` holds.
pub async fn eventually<F: FnMut() -> bool>(mut cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

pub struct FakeBackend {
    pub messages: Mutex<Vec<Message>>,
    pub reactions: Mutex<Vec<Reaction>>,
    pub signed_in: Mutex<Option<Profile>>,

    pub list_calls: AtomicUsize,
    pub insert_calls: AtomicUsize,
    pub fail_list: AtomicBool,
    pub fail_insert: AtomicBool,
    pub fail_get: AtomicBool,
    /// Return rows of every channel from `list_messages`.
    pub leak_channels: AtomicBool,
    /// Store and return the client token on inserts.
    pub echo_token: AtomicBool,

    /// Payload of the most recent insert, as sent.
    pub last_insert: Mutex<Option<NewMessage>>,

    /// Id for the next inserted row.
    pub next_id: Mutex<Option<String>>,
    counter: AtomicUsize,

    /// Inserts store the row, then wait for `release_inserts` before answering.
    pub hold_inserts: AtomicBool,
    pub release_inserts: Notify,
    /// Channels whose list queries wait for `release_lists`.
    pub held_lists: Mutex<HashSet<String>>,
    pub release_lists: Notify,

    topics: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ChangeEvent>>>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
            signed_in: Mutex::new(Some(profile("U42"))),
            list_calls: AtomicUsize::new(0),
            insert_calls: AtomicUsize::new(0),
            fail_list: AtomicBool::new(false),
            fail_insert: AtomicBool::new(false),
            fail_get: AtomicBool::new(false),
            leak_channels: AtomicBool::new(false),
            echo_token: AtomicBool::new(true),
            last_insert: Mutex::new(None),
            next_id: Mutex::new(None),
            counter: AtomicUsize::new(0),
            hold_inserts: AtomicBool::new(false),
            release_inserts: Notify::new(),
            held_lists: Mutex::new(HashSet::new()),
            release_lists: Notify::new(),
            topics: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn sources(self: &Arc<Self>) -> FeedSources {
        FeedSources {
            messages: self.clone(),
            realtime: self.clone(),
            identity: self.clone(),
        }
    }

    pub fn seed(&self, messages: impl IntoIterator<Item = Message>) {
        self.messages.lock().unwrap().extend(messages);
    }

    pub fn stored(&self, id: &str) -> Option<Message> {
        self.messages.lock().unwrap().iter().find(|m| m.id == id).cloned()
    }

    /// Push a change on a live topic. Returns `false` if nobody is subscribed.
    pub fn push(&self, topic: &Topic, event: ChangeEvent) -> bool {
        match self.topics.lock().unwrap().get(&topic.name()) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn live_topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn with_reactions(&self, mut message: Message) -> Message {
        message.reactions = self
            .reactions
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.message_id == message.id)
            .cloned()
            .collect();
        message
    }
}

#[async_trait]
impl MessageSource for FakeBackend {
    async fn list_messages(&self, channel_id: &str, limit: usize) -> Result<Vec<Message>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let held = self.held_lists.lock().unwrap().contains(channel_id);
        if held {
            self.release_lists.notified().await;
        }
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(SourceError::Remote("connection reset".into()));
        }

        let leak = self.leak_channels.load(Ordering::SeqCst);
        let mut rows: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| leak || m.channel_id == channel_id)
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.into_iter().skip(skip).map(|m| self.with_reactions(m)).collect())
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, SourceError> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(SourceError::Remote("timeout".into()));
        }
        Ok(self.stored(message_id).map(|m| self.with_reactions(m)))
    }

    async fn list_reactions(&self, message_id: &str) -> Result<Vec<Reaction>, SourceError> {
        Ok(self
            .reactions
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn insert_message(&self, new: &NewMessage) -> Result<Message, SourceError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_insert.lock().unwrap() = Some(new.clone());
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(SourceError::Rejected {
                status: 403,
                message: "row-level security violation".into(),
            });
        }

        let id = self
            .next_id
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| format!("m-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1));
        let now = Utc::now();
        let stored = Message {
            id,
            content: new.content.clone(),
            image_url: new.image_url.clone(),
            channel_id: new.channel_id.clone(),
            user_id: new.user_id.clone(),
            created_at: now,
            updated_at: now,
            parent_id: new.parent_id.clone(),
            client_token: if self.echo_token.load(Ordering::SeqCst) {
                new.client_token.clone()
            } else {
                None
            },
            profile: Some(profile(&new.user_id)),
            reactions: vec![],
        };
        self.messages.lock().unwrap().push(stored.clone());

        if self.hold_inserts.load(Ordering::SeqCst) {
            self.release_inserts.notified().await;
        }
        Ok(stored)
    }

    async fn toggle_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<bool, SourceError> {
        let mut reactions = self.reactions.lock().unwrap();
        let before = reactions.len();
        reactions.retain(|r| !(r.message_id == message_id && r.user_id == user_id && r.emoji == emoji));
        if reactions.len() != before {
            return Ok(false);
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        reactions.push(Reaction {
            id: format!("r-{}", n),
            message_id: message_id.into(),
            user_id: user_id.into(),
            emoji: emoji.into(),
        });
        Ok(true)
    }
}

#[async_trait]
impl RealtimeSource for FakeBackend {
    async fn subscribe(&self, topic: Topic) -> Result<Subscription, SourceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = topic.name();
        self.topics.lock().unwrap().insert(name.clone(), tx);

        let topics = self.topics.clone();
        Ok(Subscription::new(topic, rx).on_drop(move || {
            topics.lock().unwrap().remove(&name);
        }))
    }
}

#[async_trait]
impl Identity for FakeBackend {
    async fn current_user(&self) -> Result<Option<Profile>, SourceError> {
        Ok(self.signed_in.lock().unwrap().clone())
    }
}
