use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{ChangeKind, Table};

// -- Realtime wire frames --

/// Topic used for connection-level frames such as heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";

/// Envelope of every frame on the realtime websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

/// One `postgres_changes` binding requested in a join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBinding {
    pub event: String,
    pub schema: String,
    pub table: Table,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    pub postgres_changes: Vec<ChangeBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub config: JoinConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

/// Payload of a `postgres_changes` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePayload {
    pub data: ChangeData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeData {
    pub table: Table,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
}

// -- REST --

/// Identity returned by the auth endpoint. Only the id is used; the
/// display fields come from the `profiles` table.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct NewReaction<'a> {
    pub message_id: &'a str,
    pub user_id: &'a str,
    pub emoji: &'a str,
}

/// Error body returned by the REST interface on rejected requests.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub hint: Option<String>,
}
