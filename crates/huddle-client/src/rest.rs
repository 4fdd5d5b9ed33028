use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use huddle_feed::{Identity, MessageSource, SourceError};
use huddle_types::api::{AuthUser, NewReaction};
use huddle_types::models::{Message, NewMessage, Profile, Reaction};

use crate::config::ClientConfig;
use crate::error::{ClientError, rejected, transport};

/// Columns selected for a message: the row plus author and reactions.
const MESSAGE_SELECT: &str =
    "*,profile:profiles(id,username,full_name,avatar_url),reactions:message_reactions(id,message_id,user_id,emoji)";
const PROFILE_SELECT: &str = "id,username,full_name,avatar_url";

/// Table access over the backend's REST query interface.
pub struct RestSource {
    http: Client,
    config: ClientConfig,
    /// Profile of the session token, resolved once.
    me: Mutex<Option<Profile>>,
}

impl RestSource {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            config,
            me: Mutex::new(None),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.base(), table)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.api_key)
            .bearer_auth(self.config.bearer())
    }

    fn get(&self, table: &str) -> RequestBuilder {
        self.authed(self.http.get(self.table_url(table)))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SourceError> {
        let resp = request.send().await.map_err(transport)?;
        read_json(resp).await
    }
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, SourceError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(rejected(status.as_u16(), &body));
    }
    resp.json::<T>().await.map_err(transport)
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

#[async_trait]
impl MessageSource for RestSource {
    async fn list_messages(&self, channel_id: &str, limit: usize) -> Result<Vec<Message>, SourceError> {
        let channel = eq(channel_id);
        let limit = limit.to_string();
        let request = self.get("messages").query(&[
            ("select", MESSAGE_SELECT),
            ("channel_id", channel.as_str()),
            ("order", "created_at.desc"),
            ("limit", limit.as_str()),
        ]);

        // Newest first so the limit keeps the most recent rows.
        let mut messages: Vec<Message> = self.send(request).await?;
        messages.reverse();
        trace!(channel_id, count = messages.len(), "Listed messages");
        Ok(messages)
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, SourceError> {
        let id = eq(message_id);
        let request = self
            .get("messages")
            .query(&[("select", MESSAGE_SELECT), ("id", id.as_str()), ("limit", "1")]);

        let rows: Vec<Message> = self.send(request).await?;
        Ok(rows.into_iter().next())
    }

    async fn list_reactions(&self, message_id: &str) -> Result<Vec<Reaction>, SourceError> {
        let parent = eq(message_id);
        let request = self
            .get("message_reactions")
            .query(&[("select", "id,message_id,user_id,emoji"), ("message_id", parent.as_str())]);
        self.send(request).await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message, SourceError> {
        let request = self
            .authed(self.http.post(self.table_url("messages")))
            .query(&[("select", MESSAGE_SELECT)])
            .header("Prefer", "return=representation")
            .json(message);

        let rows: Vec<Message> = self.send(request).await?;
        let stored = rows
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::Decode("insert returned no row".into()))?;
        debug!(message_id = %stored.id, channel_id = %stored.channel_id, "Inserted message");
        Ok(stored)
    }

    async fn toggle_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<bool, SourceError> {
        let request = self
            .authed(self.http.delete(self.table_url("message_reactions")))
            .query(&[
                ("message_id", eq(message_id)),
                ("user_id", eq(user_id)),
                ("emoji", eq(emoji)),
            ])
            .header("Prefer", "return=representation");

        let removed: Vec<Reaction> = self.send(request).await?;
        if !removed.is_empty() {
            return Ok(false);
        }

        let request = self
            .authed(self.http.post(self.table_url("message_reactions")))
            .header("Prefer", "return=representation")
            .json(&NewReaction {
                message_id,
                user_id,
                emoji,
            });
        let _: Vec<Reaction> = self.send(request).await?;
        Ok(true)
    }
}

#[async_trait]
impl Identity for RestSource {
    async fn current_user(&self) -> Result<Option<Profile>, SourceError> {
        if self.config.access_token.is_none() {
            return Ok(None);
        }
        if let Some(me) = self.me.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Ok(Some(me));
        }

        let request = self.authed(self.http.get(format!("{}/auth/v1/user", self.config.base())));
        let user: AuthUser = match self.send(request).await {
            Ok(user) => user,
            Err(SourceError::Unauthenticated) => return Ok(None),
            Err(e) => return Err(e),
        };

        let id = eq(&user.id);
        let request = self
            .get("profiles")
            .query(&[("select", PROFILE_SELECT), ("id", id.as_str()), ("limit", "1")]);
        let rows: Vec<Profile> = self.send(request).await?;

        // Accounts without a profile row still get to post under their id.
        let profile = rows.into_iter().next().unwrap_or_else(|| Profile {
            id: user.id.clone(),
            username: String::new(),
            full_name: None,
            avatar_url: None,
        });
        debug!(user_id = %profile.id, username = %profile.username, "Resolved signed-in user");

        *self.me.lock().unwrap_or_else(PoisonError::into_inner) = Some(profile.clone());
        Ok(Some(profile))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(token: Option<&str>) -> RestSource {
        RestSource::new(ClientConfig::new("https://abc.example.co/", "anon", token).unwrap()).unwrap()
    }

    #[test]
    fn list_query_uses_filter_syntax() {
        let source = source(Some("jwt"));
        let request = source
            .get("messages")
            .query(&[("channel_id", eq("general")), ("limit", "50".into())])
            .build()
            .unwrap();

        assert_eq!(request.url().path(), "/rest/v1/messages");
        assert_eq!(request.url().query(), Some("channel_id=eq.general&limit=50"));
        assert_eq!(request.headers()["apikey"], "anon");
        assert_eq!(request.headers()["authorization"], "Bearer jwt");
    }

    #[tokio::test]
    async fn signed_out_without_session_token() {
        let source = source(None);
        assert_eq!(source.current_user().await.unwrap(), None);
    }
}
