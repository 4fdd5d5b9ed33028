use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use huddle_types::events::ChangeEvent;
use huddle_types::models::{Message, NewMessage, Profile, TEMP_ID_PREFIX};

use crate::cache::MessageCache;
use crate::config::FeedConfig;
use crate::error::{FeedError, SourceError};
use crate::fetcher::Fetcher;
use crate::reconcile::{FetchMark, PendingSend, Timeline};
use crate::source::{Identity, MessageSource, RealtimeSource};
use crate::subscription::{SubscriptionManager, TaggedEvent};

const NOTICE_CAPACITY: usize = 64;

/// Backend seams a feed runs against.
#[derive(Clone)]
pub struct FeedSources {
    pub messages: Arc<dyn MessageSource>,
    pub realtime: Arc<dyn RealtimeSource>,
    pub identity: Arc<dyn Identity>,
}

/// What the UI renders: the active channel and its visible messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot {
    pub channel_id: Option<String>,
    pub messages: Vec<Message>,
    pub is_loading: bool,
}

/// User-facing notifications (toasts).
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    LoadFailed { channel_id: String, reason: String },
    SendFailed { channel_id: String, content: Option<String>, reason: String },
    /// An optimistic send never got confirmed and was dropped.
    SendExpired { channel_id: String, content: Option<String> },
    ReactionFailed { message_id: String, reason: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoadFailed { channel_id, reason } => {
                write!(f, "Could not load messages for #{}: {}", channel_id, reason)
            }
            Self::SendFailed { channel_id, reason, .. } => {
                write!(f, "Message to #{} failed to send: {}", channel_id, reason)
            }
            Self::SendExpired { channel_id, .. } => {
                write!(f, "Message to #{} was not confirmed, please resend", channel_id)
            }
            Self::ReactionFailed { reason, .. } => write!(f, "Could not update reaction: {}", reason),
        }
    }
}

struct FeedState {
    active: Option<String>,
    /// Bumped on every activation and deactivation. Async work captures it
    /// when issued and is discarded if it no longer matches.
    generation: u64,
    timeline: Timeline,
    is_loading: bool,
}

struct FeedInner {
    config: FeedConfig,
    fetcher: Fetcher,
    source: Arc<dyn MessageSource>,
    identity: Arc<dyn Identity>,
    state: Mutex<FeedState>,
    subscriptions: tokio::sync::Mutex<SubscriptionManager>,
    snapshots: watch::Sender<FeedSnapshot>,
    notices: broadcast::Sender<Notice>,
}

/// Message feed of one active channel: cached reads, optimistic sends and
/// realtime reconciliation.
///
/// Must be created inside a tokio runtime; realtime events are applied by a
/// background task that lives as long as the feed.
#[derive(Clone)]
pub struct ChannelFeed {
    inner: Arc<FeedInner>,
}

impl ChannelFeed {
    pub fn new(config: FeedConfig, sources: FeedSources) -> Self {
        let cache = Arc::new(MessageCache::new(config.cache_ttl));
        Self::with_cache(config, sources, cache)
    }

    /// Build a feed over an existing cache, e.g. one shared by several feeds.
    pub fn with_cache(config: FeedConfig, sources: FeedSources, cache: Arc<MessageCache>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshots, _) = watch::channel(FeedSnapshot::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        let inner = Arc::new(FeedInner {
            fetcher: Fetcher::new(sources.messages.clone(), cache, config.fetch_limit),
            source: sources.messages,
            identity: sources.identity,
            state: Mutex::new(FeedState {
                active: None,
                generation: 0,
                timeline: Timeline::new(config.match_window),
                is_loading: false,
            }),
            subscriptions: tokio::sync::Mutex::new(SubscriptionManager::new(sources.realtime, event_tx)),
            snapshots,
            notices,
            config,
        });

        spawn_event_loop(Arc::downgrade(&inner), event_rx);
        Self { inner }
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        self.inner.fetcher.cache()
    }

    pub fn active_channel(&self) -> Option<String> {
        self.inner.state().active.clone()
    }

    /// Visible messages of the active channel, oldest first. Empty when no
    /// channel is active.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.state().timeline.messages().to_vec()
    }

    /// True only while the first, uncached load of a channel is in flight.
    pub fn is_loading(&self) -> bool {
        self.inner.state().is_loading
    }

    pub fn snapshots(&self) -> watch::Receiver<FeedSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    /// Make `channel_id` the active channel.
    ///
    /// The visible list is cleared before anything is awaited. A valid cache
    /// entry is shown at once and refreshed in the background; otherwise the
    /// channel is loaded with `is_loading` set.
    pub async fn activate(&self, channel_id: &str) -> Result<(), FeedError> {
        let inner = &self.inner;
        let generation = {
            let mut state = inner.state();
            state.generation += 1;
            state.active = Some(channel_id.to_string());
            state.timeline.clear();
            state.is_loading = false;
            inner.publish(&state);
            state.generation
        };
        info!(channel_id, generation, "Activating channel");

        inner.resubscribe(channel_id, generation).await;

        if let Some(cached) = inner.fetcher.cache().read(channel_id) {
            // The mark is taken before the query goes out, so realtime
            // changes applied while it runs survive its result.
            let Some(mark) = inner.show_cached(generation, cached) else {
                return Err(FeedError::Superseded(channel_id.to_string()));
            };
            let background = Arc::clone(inner);
            let channel = channel_id.to_string();
            tokio::spawn(async move {
                match background.fetcher.fetch_channel_messages(&channel, false).await {
                    Ok(messages) => {
                        background.apply_fetch(generation, mark, messages);
                    }
                    Err(e) => {
                        warn!(channel_id = %channel, "Background refresh failed: {}", e);
                        background.fetch_failed(generation, mark, &channel, &e);
                    }
                }
            });
            return Ok(());
        }

        let mark = {
            let mut state = inner.state();
            if state.generation != generation {
                return Err(FeedError::Superseded(channel_id.to_string()));
            }
            state.is_loading = true;
            inner.publish(&state);
            state.timeline.begin_fetch()
        };

        match inner.fetcher.fetch_channel_messages(channel_id, true).await {
            Ok(messages) => {
                if inner.apply_fetch(generation, mark, messages) {
                    Ok(())
                } else {
                    Err(FeedError::Superseded(channel_id.to_string()))
                }
            }
            Err(e) => {
                error!(channel_id, "Failed to load messages: {}", e);
                inner.finish_loading(generation);
                inner.fetch_failed(generation, mark, channel_id, &e);
                Err(e.into())
            }
        }
    }

    /// Leave the active channel: empty list, no subscriptions.
    pub async fn deactivate(&self) {
        let generation = {
            let mut state = self.inner.state();
            state.generation += 1;
            state.active = None;
            state.timeline.clear();
            state.is_loading = false;
            self.inner.publish(&state);
            state.generation
        };

        let mut subscriptions = self.inner.subscriptions.lock().await;
        if self.inner.is_current(generation) {
            subscriptions.unsubscribe();
        }
    }

    /// Invalidate the active channel's cache entry and reload it.
    pub async fn force_refresh(&self) -> Result<(), FeedError> {
        let (channel_id, generation) = self.inner.current().ok_or(FeedError::NoActiveChannel)?;
        let Some(mark) = self.inner.begin_fetch(generation) else {
            return Err(FeedError::Superseded(channel_id));
        };
        self.inner.fetcher.cache().invalidate(&channel_id);

        match self.inner.fetcher.fetch_channel_messages(&channel_id, false).await {
            Ok(messages) => {
                if self.inner.apply_fetch(generation, mark, messages) {
                    Ok(())
                } else {
                    Err(FeedError::Superseded(channel_id))
                }
            }
            Err(e) => {
                error!(channel_id = %channel_id, "Refresh failed: {}", e);
                self.inner.fetch_failed(generation, mark, &channel_id, &e);
                Err(e.into())
            }
        }
    }

    /// Post a message to the active channel.
    ///
    /// Shows an optimistic row right away and swaps it for the stored row
    /// once confirmed. Returns `Ok(None)` without doing anything when nobody
    /// is signed in, no channel is active, or both `content` and `image_url`
    /// are empty. Failures roll the row back and are also published as a
    /// [`Notice::SendFailed`], so callers may ignore the result.
    pub async fn send_message(&self, content: &str, image_url: Option<&str>) -> Result<Option<Message>, FeedError> {
        self.send(content, image_url, None).await
    }

    /// Like [`ChannelFeed::send_message`], threaded under `parent_id`.
    pub async fn send_reply(
        &self,
        parent_id: &str,
        content: &str,
        image_url: Option<&str>,
    ) -> Result<Option<Message>, FeedError> {
        self.send(content, image_url, Some(parent_id)).await
    }

    async fn send(
        &self,
        content: &str,
        image_url: Option<&str>,
        parent_id: Option<&str>,
    ) -> Result<Option<Message>, FeedError> {
        let inner = &self.inner;
        let content = Some(content.trim()).filter(|c| !c.is_empty()).map(str::to_string);
        let image_url = image_url.map(str::trim).filter(|u| !u.is_empty()).map(str::to_string);
        if content.is_none() && image_url.is_none() {
            debug!("Ignoring empty message");
            return Ok(None);
        }

        let profile = match inner.identity.current_user().await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                debug!("Ignoring send while signed out");
                return Ok(None);
            }
            Err(e) => {
                warn!("Could not resolve current user: {}", e);
                if let Some((channel_id, _)) = inner.current() {
                    inner.notify(Notice::SendFailed {
                        channel_id,
                        content,
                        reason: e.to_string(),
                    });
                }
                return Err(e.into());
            }
        };

        let token = Uuid::new_v4().to_string();
        let now = Utc::now();

        let (channel_id, generation) = {
            let mut state = inner.state();
            let Some(channel_id) = state.active.clone() else {
                debug!("Ignoring send with no active channel");
                return Ok(None);
            };
            let temp = Message {
                id: temp_message_id(now),
                content: content.clone(),
                image_url: image_url.clone(),
                channel_id: channel_id.clone(),
                user_id: profile.id.clone(),
                created_at: now,
                updated_at: now,
                parent_id: parent_id.map(str::to_string),
                client_token: Some(token.clone()),
                profile: Some(profile.clone()),
                reactions: vec![],
            };
            let pending = PendingSend {
                token: token.clone(),
                temp_id: temp.id.clone(),
                channel_id: channel_id.clone(),
                user_id: profile.id.clone(),
                content: content.clone(),
                created_at: now,
                issued_at: Instant::now(),
            };
            debug!(channel_id = %channel_id, temp_id = %temp.id, "Sending message");
            state.timeline.push_pending(temp, pending);
            inner.publish(&state);
            (channel_id, state.generation)
        };

        let new = NewMessage {
            channel_id: channel_id.clone(),
            user_id: profile.id.clone(),
            content: content.clone(),
            image_url,
            parent_id: parent_id.map(str::to_string),
            client_token: inner.config.send_client_tokens.then(|| token.clone()),
        };

        match inner.source.insert_message(&new).await {
            Ok(stored) => {
                let stored = with_profile(stored, &profile);
                if stored.channel_id != channel_id {
                    warn!(
                        channel_id = %channel_id,
                        message_id = %stored.id,
                        "Insert response belongs to another channel"
                    );
                } else {
                    inner.apply_confirmed(generation, &channel_id, stored.clone());
                }
                Ok(Some(stored))
            }
            Err(e) => {
                error!(channel_id = %channel_id, "Failed to send message: {}", e);
                {
                    let mut state = inner.state();
                    if state.generation == generation && state.timeline.fail(&token).is_some() {
                        inner.publish(&state);
                    }
                }
                inner.notify(Notice::SendFailed {
                    channel_id,
                    content,
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Add or remove the signed-in user's `emoji` reaction on a message.
    /// Returns `true` when the reaction was added.
    pub async fn toggle_reaction(&self, message_id: &str, emoji: &str) -> Result<bool, FeedError> {
        let inner = &self.inner;
        let result = match inner.identity.current_user().await {
            Ok(Some(profile)) => inner.source.toggle_reaction(message_id, &profile.id, emoji).await,
            Ok(None) => Err(SourceError::Unauthenticated),
            Err(e) => Err(e),
        };

        match result {
            Ok(added) => {
                debug!(message_id, emoji, added, "Toggled reaction");
                if let Some((channel_id, generation)) = inner.current() {
                    inner.refresh_reactions(generation, &channel_id, message_id).await;
                }
                Ok(added)
            }
            Err(e) => {
                warn!(message_id, "Failed to toggle reaction: {}", e);
                inner.notify(Notice::ReactionFailed {
                    message_id: message_id.to_string(),
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Drop optimistic rows that stayed unconfirmed past the grace period.
    /// Each dropped send is reported as a [`Notice::SendExpired`].
    pub fn sweep_stale(&self) -> usize {
        self.inner.sweep_stale()
    }

    /// Run [`ChannelFeed::sweep_stale`] on the configured interval until the
    /// feed is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.sweep_stale();
            }
        })
    }
}

fn spawn_event_loop(weak: Weak<FeedInner>, mut events: mpsc::UnboundedReceiver<TaggedEvent>) {
    tokio::spawn(async move {
        while let Some(tagged) = events.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.handle_event(tagged).await;
        }
        trace!("Feed event loop stopped");
    });
}

/// `temp-<millis>-<random>`.
fn temp_message_id(now: DateTime<Utc>) -> String {
    format!("{}{}-{:08x}", TEMP_ID_PREFIX, now.timestamp_millis(), rand::random::<u32>())
}

/// Insert responses may come back without the author snapshot.
fn with_profile(mut message: Message, profile: &Profile) -> Message {
    if message.profile.is_none() && message.user_id == profile.id {
        message.profile = Some(profile.clone());
    }
    message
}

impl FeedInner {
    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<(String, u64)> {
        let state = self.state();
        state.active.clone().map(|channel_id| (channel_id, state.generation))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state().generation == generation
    }

    fn publish(&self, state: &FeedState) {
        self.snapshots.send_replace(FeedSnapshot {
            channel_id: state.active.clone(),
            messages: state.timeline.messages().to_vec(),
            is_loading: state.is_loading,
        });
    }

    fn notify(&self, notice: Notice) {
        // No receivers is fine: nobody is showing toasts.
        let _ = self.notices.send(notice);
    }

    async fn resubscribe(&self, channel_id: &str, generation: u64) {
        let mut subscriptions = self.subscriptions.lock().await;
        if !self.is_current(generation) {
            // A newer activation owns the subscriptions now.
            return;
        }
        if let Err(e) = subscriptions.subscribe(channel_id, generation).await {
            warn!(channel_id, "Realtime subscription failed, continuing without live updates: {}", e);
        }
    }

    /// Mark the start of a fetch for the active channel. `None` if the
    /// channel changed since `generation` was taken.
    fn begin_fetch(&self, generation: u64) -> Option<FetchMark> {
        let mut state = self.state();
        (state.generation == generation).then(|| state.timeline.begin_fetch())
    }

    /// Show a cache entry as is and mark the start of its background refresh.
    fn show_cached(&self, generation: u64, messages: Vec<Message>) -> Option<FetchMark> {
        let mut state = self.state();
        if state.generation != generation {
            return None;
        }
        state.timeline.replace_all(messages);
        self.publish(&state);
        Some(state.timeline.begin_fetch())
    }

    /// Merge a fetch result into the view and write the merged rows back to
    /// the cache. Returns `false` if the channel changed meanwhile.
    fn apply_fetch(&self, generation: u64, mark: FetchMark, messages: Vec<Message>) -> bool {
        let mut state = self.state();
        if state.generation != generation {
            trace!(generation, "Discarding fetch for inactive channel");
            return false;
        }
        state.timeline.merge_fetch(messages, mark);
        state.is_loading = false;
        if let Some(channel_id) = &state.active {
            self.fetcher.cache().write(channel_id, &state.timeline.confirmed());
        }
        self.publish(&state);
        true
    }

    /// Release `mark` and report the failure, unless the user has moved on.
    fn fetch_failed(&self, generation: u64, mark: FetchMark, channel_id: &str, e: &SourceError) {
        {
            let mut state = self.state();
            if state.generation != generation {
                debug!(channel_id, "Not reporting failed load for inactive channel");
                return;
            }
            state.timeline.abandon_fetch(mark);
        }
        self.notify(Notice::LoadFailed {
            channel_id: channel_id.to_string(),
            reason: e.to_string(),
        });
    }

    fn finish_loading(&self, generation: u64) {
        let mut state = self.state();
        if state.generation == generation && state.is_loading {
            state.is_loading = false;
            self.publish(&state);
        }
    }

    /// Record a confirmed row in the cache and, if its channel is still
    /// active, in the view. The cache is written under the state lock so a
    /// concurrent fetch merge cannot drop the row from it.
    fn apply_confirmed(&self, generation: u64, channel_id: &str, message: Message) {
        let mut state = self.state();
        self.fetcher.cache().upsert(channel_id, &message);
        if state.generation != generation || state.active.as_deref() != Some(message.channel_id.as_str()) {
            return;
        }
        let message_id = message.id.clone();
        let placement = state.timeline.confirm(message);
        debug!(message_id = %message_id, ?placement, "Merged confirmed message");
        self.publish(&state);
    }

    async fn handle_event(&self, tagged: TaggedEvent) {
        let TaggedEvent {
            generation,
            channel_id,
            event,
        } = tagged;

        if !self.is_current(generation) {
            trace!(
                channel_id = %channel_id,
                message_id = event.message_id().unwrap_or("-"),
                "Dropping event for inactive channel"
            );
            return;
        }

        match event {
            ChangeEvent::MessageInserted(row) => {
                let message = match self.fetcher.fetch_one_message(&row.id).await {
                    Some(full) => full,
                    None => row,
                };
                if message.channel_id != channel_id {
                    warn!(channel_id = %channel_id, message_id = %message.id, "Ignoring insert from another channel");
                    return;
                }
                self.apply_confirmed(generation, &channel_id, message);
            }
            ChangeEvent::MessageUpdated(row) => {
                let message = match self.fetcher.fetch_one_message(&row.id).await {
                    Some(full) => full,
                    None => row,
                };
                if message.channel_id != channel_id {
                    warn!(channel_id = %channel_id, message_id = %message.id, "Ignoring update from another channel");
                    return;
                }
                self.apply_update(generation, &channel_id, message);
            }
            ChangeEvent::MessageDeleted { id } => {
                let mut state = self.state();
                self.fetcher.cache().remove(&channel_id, &id);
                if state.generation == generation && state.timeline.remove(&id) {
                    debug!(message_id = %id, "Removed deleted message");
                    self.publish(&state);
                }
            }
            ChangeEvent::ReactionAdded(reaction) => {
                self.refresh_reactions(generation, &channel_id, &reaction.message_id)
                    .await;
            }
            ChangeEvent::ReactionRemoved { id, message_id } => {
                let message_id = message_id.or_else(|| {
                    self.state()
                        .timeline
                        .reaction_owner(&id)
                        .map(str::to_string)
                });
                if let Some(message_id) = message_id {
                    self.refresh_reactions(generation, &channel_id, &message_id).await;
                }
            }
        }
    }

    fn apply_update(&self, generation: u64, channel_id: &str, mut message: Message) {
        let mut state = self.state();
        if state.generation != generation {
            return;
        }

        // Bare realtime rows carry neither author nor reactions; keep what
        // is already shown.
        if let Some(existing) = state.timeline.messages().iter().find(|m| m.id == message.id) {
            if message.profile.is_none() {
                message.profile = existing.profile.clone();
            }
            if message.reactions.is_empty() {
                message.reactions = existing.reactions.clone();
            }
        }

        if state.timeline.update(message.clone()) {
            self.fetcher.cache().upsert(channel_id, &message);
            self.publish(&state);
        } else {
            debug!(message_id = %message.id, "Update for message not in view");
        }
    }

    async fn refresh_reactions(&self, generation: u64, channel_id: &str, message_id: &str) {
        if !self.state().timeline.contains(message_id) {
            trace!(message_id, "Reaction for message not in view");
            return;
        }

        let Some(reactions) = self.fetcher.fetch_reactions(message_id).await else {
            return;
        };

        let mut state = self.state();
        if state.generation != generation {
            return;
        }
        if let Some(updated) = state.timeline.set_reactions(message_id, reactions) {
            let updated = updated.clone();
            self.fetcher.cache().upsert(channel_id, &updated);
            self.publish(&state);
        }
    }

    fn sweep_stale(&self) -> usize {
        let expired = {
            let mut state = self.state();
            let expired = state.timeline.sweep(self.config.pending_grace);
            if !expired.is_empty() {
                self.publish(&state);
            }
            expired
        };

        for pending in &expired {
            warn!(
                channel_id = %pending.channel_id,
                temp_id = %pending.temp_id,
                "Dropping message that was never confirmed"
            );
            self.notify(Notice::SendExpired {
                channel_id: pending.channel_id.clone(),
                content: pending.content.clone(),
            });
        }
        expired.len()
    }
}
