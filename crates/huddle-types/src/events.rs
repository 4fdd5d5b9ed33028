use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Message, Reaction};

/// Backend tables the feed subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Messages,
    MessageReactions,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::MessageReactions => "message_reactions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A realtime subscription target: one table, optionally narrowed by an
/// equality filter, scoped to the channel the feed is showing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub table: Table,
    pub channel_id: String,
    /// PostgREST-style filter, e.g. `channel_id=eq.general`.
    pub filter: Option<String>,
}

impl Topic {
    /// Message row changes for a single channel.
    pub fn messages(channel_id: &str) -> Self {
        Self {
            table: Table::Messages,
            channel_id: channel_id.to_string(),
            filter: Some(format!("channel_id=eq.{}", channel_id)),
        }
    }

    /// Reaction changes. The reactions table carries no channel column, so
    /// this is unfiltered and consumers drop reactions for messages they
    /// are not showing.
    pub fn reactions(channel_id: &str) -> Self {
        Self {
            table: Table::MessageReactions,
            channel_id: channel_id.to_string(),
            filter: None,
        }
    }

    /// Wire name of the topic, unique per (table, channel).
    pub fn name(&self) -> String {
        format!("realtime:{}:{}", self.table.as_str(), self.channel_id)
    }
}

/// A row change pushed by the realtime source.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    MessageInserted(Message),
    MessageUpdated(Message),
    MessageDeleted { id: String },
    ReactionAdded(Reaction),
    /// Delete payloads may only carry the primary key, so the parent
    /// message id is not always known.
    ReactionRemoved { id: String, message_id: Option<String> },
}

#[derive(Deserialize)]
struct RowKey {
    id: String,
    #[serde(default)]
    message_id: Option<String>,
}

impl ChangeEvent {
    /// Build an event from a raw table change.
    pub fn from_change(
        table: Table,
        kind: ChangeKind,
        record: Option<Value>,
        old_record: Option<Value>,
    ) -> Result<Self, serde_json::Error> {
        let required = |value: Option<Value>, which: &str| {
            value
                .filter(|v| !v.is_null())
                .ok_or_else(|| serde_json::Error::custom(format!("{} change without {}", table.as_str(), which)))
        };

        let event = match (table, kind) {
            (Table::Messages, ChangeKind::Insert) => {
                Self::MessageInserted(serde_json::from_value(required(record, "record")?)?)
            }
            (Table::Messages, ChangeKind::Update) => {
                Self::MessageUpdated(serde_json::from_value(required(record, "record")?)?)
            }
            (Table::Messages, ChangeKind::Delete) => {
                let key: RowKey = serde_json::from_value(required(old_record, "old_record")?)?;
                Self::MessageDeleted { id: key.id }
            }
            (Table::MessageReactions, ChangeKind::Insert | ChangeKind::Update) => {
                Self::ReactionAdded(serde_json::from_value(required(record, "record")?)?)
            }
            (Table::MessageReactions, ChangeKind::Delete) => {
                let key: RowKey = serde_json::from_value(required(old_record, "old_record")?)?;
                Self::ReactionRemoved {
                    id: key.id,
                    message_id: key.message_id,
                }
            }
        };

        Ok(event)
    }

    /// Id of the message this event concerns, when known.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::MessageInserted(m) | Self::MessageUpdated(m) => Some(&m.id),
            Self::MessageDeleted { id } => Some(id),
            Self::ReactionAdded(r) => Some(&r.message_id),
            Self::ReactionRemoved { message_id, .. } => message_id.as_deref(),
        }
    }
}
