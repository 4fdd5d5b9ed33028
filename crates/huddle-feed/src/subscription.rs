use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use huddle_types::events::{ChangeEvent, Topic};

use crate::error::SourceError;
use crate::source::{RealtimeSource, SubscriptionGuard};

/// A realtime change tagged with the channel activation it was received for.
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub generation: u64,
    pub channel_id: String,
    pub event: ChangeEvent,
}

enum State {
    Idle,
    Subscribed {
        channel_id: String,
        guards: Vec<SubscriptionGuard>,
        pumps: Vec<JoinHandle<()>>,
    },
}

/// Holds the message and reaction subscriptions of the active channel.
///
/// At most one channel is subscribed at a time: subscribing to a new channel
/// tears the previous pair down before anything else happens. Events from
/// both streams are forwarded, tagged, into a single sink.
pub struct SubscriptionManager {
    realtime: Arc<dyn RealtimeSource>,
    sink: mpsc::UnboundedSender<TaggedEvent>,
    state: State,
}

impl SubscriptionManager {
    pub fn new(realtime: Arc<dyn RealtimeSource>, sink: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self {
            realtime,
            sink,
            state: State::Idle,
        }
    }

    /// Channel currently subscribed, if any.
    pub fn channel(&self) -> Option<&str> {
        match &self.state {
            State::Idle => None,
            State::Subscribed { channel_id, .. } => Some(channel_id.as_str()),
        }
    }

    /// Switch to `channel_id`. On error the manager is left idle.
    pub async fn subscribe(&mut self, channel_id: &str, generation: u64) -> Result<(), SourceError> {
        self.unsubscribe();

        let messages = self.realtime.subscribe(Topic::messages(channel_id)).await?;
        let reactions = self.realtime.subscribe(Topic::reactions(channel_id)).await?;

        let mut guards = Vec::with_capacity(2);
        let mut pumps = Vec::with_capacity(2);
        for subscription in [messages, reactions] {
            let topic = subscription.topic().name();
            let (guard, events) = subscription.split();
            guards.push(guard);
            pumps.push(self.pump(topic, events, channel_id.to_string(), generation));
        }

        info!(channel_id, generation, "Subscribed to realtime changes");
        self.state = State::Subscribed {
            channel_id: channel_id.to_string(),
            guards,
            pumps,
        };
        Ok(())
    }

    fn pump(
        &self,
        topic: String,
        mut events: mpsc::UnboundedReceiver<ChangeEvent>,
        channel_id: String,
        generation: u64,
    ) -> JoinHandle<()> {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let tagged = TaggedEvent {
                    generation,
                    channel_id: channel_id.clone(),
                    event,
                };
                if sink.send(tagged).is_err() {
                    break;
                }
            }
            debug!(topic = %topic, "Realtime stream ended");
        })
    }

    pub fn unsubscribe(&mut self) {
        if let State::Subscribed {
            channel_id,
            guards,
            pumps,
        } = std::mem::replace(&mut self.state, State::Idle)
        {
            drop(guards);
            for pump in pumps {
                pump.abort();
            }
            info!(channel_id = %channel_id, "Unsubscribed from realtime changes");
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
