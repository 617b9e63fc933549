//! Realtime websocket client for database change events.
//!
//! One socket is shared by every joined topic. Frames use Phoenix channel
//! framing (`phx_join`, `phx_leave`, `heartbeat`, `postgres_changes`).
//! The socket reconnects with exponential backoff and re-joins every live
//! topic; consumers keep their receivers across reconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use crate::{BackendConfig, BackendError, Binding, ChangeEvent, ChangeKind, RealtimeTransport, Row};

/// Prefix the service puts in front of channel names.
const TOPIC_PREFIX: &str = "realtime:";

/// Heartbeat cadence; the service drops sockets silent for ~60s.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Read timeout before the socket is considered dead.
const READ_TIMEOUT: Duration = Duration::from_secs(90);

/// Buffer size for each joined topic.
const TOPIC_BUFFER: usize = 256;

/// A Phoenix channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    fn heartbeat(reference: String) -> Self {
        Self {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(reference),
            join_ref: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangesPayload {
    data: ChangeData,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    table: String,
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    record: Option<Row>,
    #[serde(default)]
    old_record: Option<Row>,
    #[serde(default)]
    commit_timestamp: Option<DateTime<Utc>>,
}

/// Decode a `postgres_changes` payload into a change event.
pub fn parse_change(payload: &Value) -> Result<ChangeEvent, BackendError> {
    let payload: ChangesPayload = serde_json::from_value(payload.clone())?;
    let data = payload.data;
    let new = match data.kind {
        ChangeKind::Delete => None,
        _ => data.record,
    };
    let old = data.old_record.filter(|row| !row.is_empty());
    Ok(ChangeEvent {
        table: data.table,
        kind: data.kind,
        new,
        old,
        commit_timestamp: data.commit_timestamp,
    })
}

struct SocketTopic {
    bindings: Vec<Binding>,
    tx: mpsc::Sender<ChangeEvent>,
    join_ref: String,
}

struct SocketInner {
    url: String,
    access_token: Option<String>,
    topics: DashMap<String, SocketTopic>,
    outbound: mpsc::UnboundedSender<Frame>,
    next_ref: AtomicU64,
}

/// Shared realtime socket.
#[derive(Clone)]
pub struct RealtimeSocket {
    inner: Arc<SocketInner>,
}

impl RealtimeSocket {
    /// Start the socket task. Runs until `shutdown_rx` flips to `true`.
    pub fn connect(
        config: &BackendConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (socket, outbound_rx) = Self::detached(config.realtime_url(), config.access_token.clone());
        let inner = Arc::clone(&socket.inner);
        let handle = tokio::spawn(async move {
            if let Err(e) = inner.run(outbound_rx, shutdown_rx).await {
                error!(error = %e, "realtime socket task failed");
            }
        });
        (socket, handle)
    }

    /// Build a socket without starting the connection task.
    fn detached(
        url: String,
        access_token: Option<String>,
    ) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SocketInner {
            url,
            access_token,
            topics: DashMap::new(),
            outbound,
            next_ref: AtomicU64::new(1),
        });
        (Self { inner }, outbound_rx)
    }
}

impl SocketInner {
    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn join_frame(&self, name: &str, bindings: &[Binding], join_ref: &str) -> Frame {
        let changes: Vec<Value> = bindings
            .iter()
            .map(|b| {
                json!({
                    "event": b.kind.map_or("*", |k| k.as_str()),
                    "schema": "public",
                    "table": b.table,
                })
            })
            .collect();

        let mut payload = json!({
            "config": {
                "broadcast": {"self": false},
                "presence": {"key": ""},
                "postgres_changes": changes,
            }
        });
        if let Some(token) = &self.access_token {
            payload["access_token"] = json!(token);
        }

        Frame {
            topic: format!("{}{}", TOPIC_PREFIX, name),
            event: "phx_join".to_string(),
            payload,
            reference: Some(join_ref.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    /// Connect and keep reconnecting until shutdown.
    async fn run(
        &self,
        mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), BackendError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            if *shutdown_rx.borrow() {
                info!("realtime socket shutting down");
                return Ok(());
            }

            match self
                .connect_and_process(&mut outbound_rx, &mut shutdown_rx, &mut backoff)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!(error = %e, "realtime connection error, reconnecting");
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return Ok(());
                            }
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn connect_and_process(
        &self,
        outbound_rx: &mut mpsc::UnboundedReceiver<Frame>,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), BackendError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| BackendError::Realtime(format!("connection failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        info!(topics = self.topics.len(), "realtime socket connected");
        backoff.reset();

        // Joins queued while disconnected are replayed from the topic map.
        while outbound_rx.try_recv().is_ok() {}
        let joins: Vec<Frame> = self
            .topics
            .iter()
            .map(|t| self.join_frame(t.key(), &t.bindings, &t.join_ref))
            .collect();
        for frame in joins {
            send_frame(&mut write, &frame).await?;
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("realtime socket received shutdown signal");
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }

                Some(frame) = outbound_rx.recv() => {
                    send_frame(&mut write, &frame).await?;
                }

                _ = heartbeat.tick() => {
                    send_frame(&mut write, &Frame::heartbeat(self.next_ref())).await?;
                }

                result = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                    match result {
                        Ok(Some(Ok(Message::Text(text)))) => self.handle_text(&text),
                        Ok(Some(Ok(Message::Close(_)))) => {
                            return Err(BackendError::Realtime("connection closed".to_string()));
                        }
                        Ok(Some(Ok(_))) => {}
                        Ok(Some(Err(e))) => {
                            return Err(BackendError::Realtime(format!("read error: {}", e)));
                        }
                        Ok(None) => {
                            return Err(BackendError::Realtime("stream ended".to_string()));
                        }
                        Err(_) => {
                            warn!("realtime read timeout after {}s", READ_TIMEOUT.as_secs());
                            return Err(BackendError::Realtime("read timeout".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Handle one text frame from the socket.
    fn handle_text(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to decode realtime frame");
                return;
            }
        };

        let Some(name) = frame.topic.strip_prefix(TOPIC_PREFIX) else {
            trace!(topic = %frame.topic, event = %frame.event, "ignoring socket-level frame");
            return;
        };

        match frame.event.as_str() {
            "postgres_changes" => match parse_change(&frame.payload) {
                Ok(event) => self.route(name, event),
                Err(e) => warn!(channel = %name, error = %e, "malformed change payload"),
            },
            "phx_reply" => {
                let status = frame.payload.get("status").and_then(Value::as_str);
                if status == Some("error") {
                    error!(
                        channel = %name,
                        response = %frame.payload["response"],
                        "channel join rejected"
                    );
                    // Dropping the sender ends the consumer's stream.
                    self.topics.remove(name);
                } else {
                    debug!(channel = %name, status = ?status, "channel reply");
                }
            }
            "phx_error" => {
                error!(channel = %name, "channel errored on server");
            }
            "phx_close" => {
                debug!(channel = %name, "channel closed by server");
            }
            other => {
                trace!(channel = %name, event = %other, "ignoring channel event");
            }
        }
    }

    fn route(&self, name: &str, event: ChangeEvent) {
        let Some(topic) = self.topics.get(name) else {
            trace!(channel = %name, "event for unknown channel");
            return;
        };
        if !topic.bindings.iter().any(|b| b.matches(&event)) {
            return;
        }
        if let Err(e) = topic.tx.try_send(event) {
            warn!(channel = %name, error = %e, "dropping change event");
        }
    }
}

async fn send_frame<S>(write: &mut S, frame: &Frame) -> Result<(), BackendError>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame)?;
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| BackendError::Realtime(format!("write error: {}", e)))
}

#[async_trait]
impl RealtimeTransport for RealtimeSocket {
    async fn join(
        &self,
        topic: &str,
        bindings: Vec<Binding>,
    ) -> Result<mpsc::Receiver<ChangeEvent>, BackendError> {
        let inner = &self.inner;
        let (frame, rx) = match inner.topics.entry(topic.to_string()) {
            Entry::Occupied(_) => {
                return Err(BackendError::Realtime(format!(
                    "tried to subscribe multiple times to topic {}",
                    topic
                )));
            }
            Entry::Vacant(slot) => {
                let join_ref = inner.next_ref();
                let frame = inner.join_frame(topic, &bindings, &join_ref);
                let (tx, rx) = mpsc::channel(TOPIC_BUFFER);
                slot.insert(SocketTopic {
                    bindings,
                    tx,
                    join_ref,
                });
                (frame, rx)
            }
        };

        inner
            .outbound
            .send(frame)
            .map_err(|_| BackendError::Realtime("socket task stopped".to_string()))?;
        debug!(channel = %topic, "joining channel");
        Ok(rx)
    }

    async fn leave(&self, topic: &str) -> Result<(), BackendError> {
        let Some((_, joined)) = self.inner.topics.remove(topic) else {
            return Ok(());
        };
        let frame = Frame {
            topic: format!("{}{}", TOPIC_PREFIX, topic),
            event: "phx_leave".to_string(),
            payload: json!({}),
            reference: Some(self.inner.next_ref()),
            join_ref: Some(joined.join_ref),
        };
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| BackendError::Realtime("socket task stopped".to_string()))?;
        debug!(channel = %topic, "leaving channel");
        Ok(())
    }
}
