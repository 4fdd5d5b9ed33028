//! Realtime change subscriptions over the backend's websocket.
//!
//! One connection carries every topic. A supervisor task owns the socket,
//! writes queued frames, sends heartbeats and routes `postgres_changes`
//! frames to the subscription of their topic. When the socket drops it
//! reconnects with backoff and joins every live topic again; changes made
//! while disconnected are not replayed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use huddle_feed::{RealtimeSource, SourceError, Subscription};
use huddle_types::api::{
    ChangeBinding, ChangePayload, EVENT_ERROR, EVENT_HEARTBEAT, EVENT_JOIN, EVENT_LEAVE, EVENT_POSTGRES_CHANGES,
    EVENT_REPLY, JoinConfig, JoinPayload, PHOENIX_TOPIC, RealtimeFrame,
};
use huddle_types::events::{ChangeEvent, Topic};

use crate::config::ClientConfig;
use crate::error::ClientError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const PROTOCOL_VSN: &str = "1.0.0";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Route {
    topic: Topic,
    events: mpsc::UnboundedSender<ChangeEvent>,
}

struct Shared {
    routes: Mutex<HashMap<String, Route>>,
    next_ref: AtomicU64,
    access_token: Option<String>,
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, HashMap<String, Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reference(&self) -> String {
        (self.next_ref.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn join_frame(&self, topic: &Topic) -> RealtimeFrame {
        join_frame(topic, self.reference(), self.access_token.clone())
    }

    /// Deliver a change frame to its subscription.
    fn route(&self, frame: RealtimeFrame) {
        let event = match decode_change(frame.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(topic = %frame.topic, "Dropping malformed change: {}", e);
                return;
            }
        };

        let mut routes = self.routes();
        let Some(route) = routes.get(&frame.topic) else {
            trace!(topic = %frame.topic, "Change for topic without subscriber");
            return;
        };
        if route.events.send(event).is_err() {
            routes.remove(&frame.topic);
        }
    }
}

/// Realtime source backed by a single multiplexed websocket.
#[derive(Clone)]
pub struct RealtimeClient {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<RealtimeFrame>,
}

impl RealtimeClient {
    /// Open the websocket and start the connection task.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let url = websocket_url(config)?;
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        info!(host = url.host_str().unwrap_or_default(), "Realtime connected");

        let shared = Arc::new(Shared {
            routes: Mutex::new(HashMap::new()),
            next_ref: AtomicU64::new(0),
            access_token: config.access_token.clone(),
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(supervise(shared.clone(), url, socket, outbound_rx));
        Ok(Self { shared, outbound })
    }
}

#[async_trait]
impl RealtimeSource for RealtimeClient {
    async fn subscribe(&self, topic: Topic) -> Result<Subscription, SourceError> {
        let name = topic.name();
        let (tx, rx) = mpsc::unbounded_channel();

        let join = self.shared.join_frame(&topic);
        self.shared.routes().insert(
            name.clone(),
            Route {
                topic: topic.clone(),
                events: tx,
            },
        );
        if self.outbound.send(join).is_err() {
            self.shared.routes().remove(&name);
            return Err(SourceError::Closed);
        }
        debug!(topic = %name, "Joined realtime topic");

        let shared = Arc::downgrade(&self.shared);
        let outbound = self.outbound.clone();
        Ok(Subscription::new(topic, rx).on_drop(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            shared.routes().remove(&name);
            let leave = RealtimeFrame {
                topic: name.clone(),
                event: EVENT_LEAVE.into(),
                payload: json!({}),
                reference: Some(shared.reference()),
            };
            // The connection task may already be gone.
            let _ = outbound.send(leave);
            debug!(topic = %name, "Left realtime topic");
        }))
    }
}

enum Exit {
    /// Socket closed or failed; reconnect.
    Disconnected,
    /// Every client handle is gone.
    Shutdown,
}

async fn supervise(
    shared: Arc<Shared>,
    url: Url,
    mut socket: Socket,
    mut outbound: mpsc::UnboundedReceiver<RealtimeFrame>,
) {
    loop {
        if let Exit::Shutdown = drive(&shared, socket, &mut outbound).await {
            break;
        }

        let mut backoff = RECONNECT_MIN;
        socket = loop {
            tokio::time::sleep(backoff).await;
            if outbound.is_closed() {
                debug!("Realtime client dropped while reconnecting");
                return;
            }
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((socket, _)) => break socket,
                Err(e) => {
                    warn!("Realtime reconnect failed, retrying in {:?}: {}", backoff, e);
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                }
            }
        };
        info!("Realtime reconnected");

        // Frames queued while offline targeted the old socket; rejoining
        // below covers every topic that is still live.
        while outbound.try_recv().is_ok() {}
        let joins: Vec<RealtimeFrame> = shared.routes().values().map(|r| shared.join_frame(&r.topic)).collect();
        for join in joins {
            let Some(msg) = encode(&join) else {
                continue;
            };
            if let Err(e) = socket.send(msg).await {
                warn!(topic = %join.topic, "Rejoin failed: {}", e);
            }
        }
    }
    debug!("Realtime connection task stopped");
}

fn encode(frame: &RealtimeFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            warn!(event = %frame.event, "Could not encode frame: {}", e);
            None
        }
    }
}

async fn drive(shared: &Shared, socket: Socket, outbound: &mut mpsc::UnboundedReceiver<RealtimeFrame>) -> Exit {
    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sender.send(Message::Close(None)).await;
                    return Exit::Shutdown;
                };
                let Some(msg) = encode(&frame) else {
                    continue;
                };
                if sender.send(msg).await.is_err() {
                    return Exit::Disconnected;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_text(shared, &text),
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("Realtime socket closed");
                        return Exit::Disconnected;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Realtime socket error: {}", e);
                        return Exit::Disconnected;
                    }
                }
            }
            _ = heartbeat.tick() => {
                let Some(msg) = encode(&heartbeat_frame(shared.reference())) else {
                    continue;
                };
                if sender.send(msg).await.is_err() {
                    return Exit::Disconnected;
                }
            }
        }
    }
}

fn handle_text(shared: &Shared, text: &str) {
    let frame: RealtimeFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            let raw: String = text.chars().take(200).collect();
            warn!("Bad realtime frame: {} -- raw: {}", e, raw);
            return;
        }
    };

    match frame.event.as_str() {
        EVENT_POSTGRES_CHANGES => shared.route(frame),
        EVENT_REPLY => {
            let status = frame.payload.get("status").and_then(Value::as_str).unwrap_or_default();
            if status != "ok" {
                warn!(topic = %frame.topic, status, response = %frame.payload["response"], "Realtime request refused");
            }
        }
        EVENT_ERROR => warn!(topic = %frame.topic, "Realtime channel error"),
        _ => trace!(topic = %frame.topic, event = %frame.event, "Ignoring realtime frame"),
    }
}

/// `{url}/realtime/v1/websocket?apikey=..&vsn=1.0.0` on the ws scheme
/// matching the project url.
fn websocket_url(config: &ClientConfig) -> Result<Url, ClientError> {
    let mut url = config.url.clone();
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(ClientError::Scheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Scheme(scheme.to_string()))?;

    let path = format!("{}/realtime/v1/websocket", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", &config.api_key)
        .append_pair("vsn", PROTOCOL_VSN);
    Ok(url)
}

fn join_frame(topic: &Topic, reference: String, access_token: Option<String>) -> RealtimeFrame {
    let payload = JoinPayload {
        config: JoinConfig {
            postgres_changes: vec![ChangeBinding {
                event: "*".into(),
                schema: "public".into(),
                table: topic.table,
                filter: topic.filter.clone(),
            }],
        },
        access_token,
    };

    RealtimeFrame {
        topic: topic.name(),
        event: EVENT_JOIN.into(),
        payload: serde_json::to_value(payload).unwrap_or_default(),
        reference: Some(reference),
    }
}

fn heartbeat_frame(reference: String) -> RealtimeFrame {
    RealtimeFrame {
        topic: PHOENIX_TOPIC.into(),
        event: EVENT_HEARTBEAT.into(),
        payload: json!({}),
        reference: Some(reference),
    }
}

fn decode_change(payload: Value) -> Result<ChangeEvent, SourceError> {
    let change: ChangePayload = serde_json::from_value(payload).map_err(|e| SourceError::Decode(e.to_string()))?;
    let data = change.data;
    ChangeEvent::from_change(data.table, data.kind, data.record, data.old_record)
        .map_err(|e| SourceError::Decode(e.to_string()))
}
