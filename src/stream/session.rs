//! A single push connection.
//!
//! One session owns one WebSocket carrying one or more multiplexed stream
//! keys. The task serializes every state transition through its event
//! loop: inbound frames, heartbeat ticks, heartbeat timeouts, and external
//! close/reconnect commands all arrive through one `select!`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;

use crate::clock::Backoff;
use crate::data::key::StreamKey;
use crate::events::{EngineEvent, SharedSink};
use crate::stream::metrics::StreamMetrics;

/// Event times older than this relative to the local clock are flagged
/// stale (but still delivered).
const STALE_THRESHOLD_MS: i64 = 10_000;

/// Correlation ids for outbound pings, fresh per process.
static PING_ID: AtomicU64 = AtomicU64::new(1);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closing,
    /// Terminal for this session instance; the supervisor may replace it.
    Failed,
}

/// External commands accepted by a session.
#[derive(Debug)]
pub enum SessionCommand {
    /// Close with code 1000; no reconnection.
    Close,
    /// Drop the socket without marking intentional, forcing reconnection.
    ForceReconnect,
}

/// A raw push event with its derived stream key, before decoding.
#[derive(Debug, Clone)]
pub struct RawStreamEvent {
    pub key: String,
    pub payload: Value,
    /// Engine-local receive time, epoch milliseconds.
    pub received_at_ms: i64,
}

/// Lifecycle notices the session reports to its supervisor.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    Opened { session_id: String },
    Closed { session_id: String },
    Failed { session_id: String },
}

/// Connection tuning for a session, derived from the engine config.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ws_base_url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Needed only for the user-data ping envelope.
    pub api_key: Option<String>,
}

/// Handle to a running session task.
pub struct SessionHandle {
    id: String,
    keys: Vec<StreamKey>,
    state: Arc<Mutex<SessionState>>,
    metrics: Arc<StreamMetrics>,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn keys(&self) -> &[StreamKey] {
        &self.keys
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    /// Request a normal close (code 1000). No-op on an idle or finished
    /// session.
    pub fn close(&self) {
        let _ = self.command_tx.send(SessionCommand::Close);
    }

    /// Drop the socket and let the reconnect schedule take over.
    pub fn force_reconnect(&self) {
        let _ = self.command_tx.send(SessionCommand::ForceReconnect);
    }

    /// Wait for the session task to finish, bounded by `timeout`.
    pub async fn join(&self, timeout: Duration) {
        let handle = self.join.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(timeout, handle).await;
        }
    }
}

/// Session id for a key set: the single key, or members joined by `/`.
pub fn session_id(keys: &[StreamKey]) -> String {
    keys.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Stream URL for a key set: `/ws/<key>` for one key,
/// `/stream?streams=<k1>/<k2>/…` for several.
pub fn stream_url(base: &str, keys: &[StreamKey]) -> String {
    let base = base.trim_end_matches('/');
    if keys.len() == 1 {
        format!("{}/ws/{}", base, keys[0])
    } else {
        format!("{}/stream?streams={}", base, session_id(keys))
    }
}

/// Spawn a session task for a key set.
pub fn spawn_session(
    keys: Vec<StreamKey>,
    config: SessionConfig,
    events_tx: mpsc::UnboundedSender<RawStreamEvent>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
    sink: SharedSink,
) -> Arc<SessionHandle> {
    let id = session_id(&keys);
    let url = stream_url(&config.ws_base_url, &keys);
    let state = Arc::new(Mutex::new(SessionState::Idle));
    let metrics = Arc::new(StreamMetrics::new());
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let task = SessionTask {
        id: id.clone(),
        url,
        config,
        state: Arc::clone(&state),
        metrics: Arc::clone(&metrics),
        events_tx,
        notice_tx,
        sink,
    };
    let join = tokio::spawn(task.run(command_rx));

    Arc::new(SessionHandle {
        id,
        keys,
        state,
        metrics,
        command_tx,
        join: Mutex::new(Some(join)),
    })
}

enum CloseReason {
    /// Close requested through the handle.
    Requested,
    /// The peer sent a close frame with this code.
    ServerClose(Option<u16>),
    /// Transport error, heartbeat timeout, or forced reconnect.
    Abnormal(String),
}

enum Frame {
    PingResponse {
        id: Option<u64>,
        listen_key: Option<String>,
    },
    Event {
        key: String,
        payload: Value,
    },
    Unknown,
}

struct SessionTask {
    id: String,
    url: String,
    config: SessionConfig,
    state: Arc<Mutex<SessionState>>,
    metrics: Arc<StreamMetrics>,
    events_tx: mpsc::UnboundedSender<RawStreamEvent>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
    sink: SharedSink,
}

impl SessionTask {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    async fn run(self, mut command_rx: mpsc::UnboundedReceiver<SessionCommand>) {
        let mut backoff = Backoff::new(
            self.config.initial_backoff,
            self.config.backoff_factor,
            self.config.max_backoff,
        );
        let mut attempts: u32 = 0;
        // Listen key survives reconnects once observed.
        let mut listen_key: Option<String> = None;

        loop {
            self.set_state(SessionState::Connecting);
            tracing::info!(session = %self.id, url = %self.url, "connecting to stream");

            match connect_async(&self.url).await {
                Ok((socket, _)) => {
                    self.set_state(SessionState::Open);
                    self.metrics.mark_connected();
                    self.sink.emit(EngineEvent::Connect {
                        stream: self.id.clone(),
                    });
                    let _ = self.notice_tx.send(SessionNotice::Opened {
                        session_id: self.id.clone(),
                    });
                    attempts = 0;
                    backoff.reset();

                    let reason = self
                        .drive_connection(socket, &mut listen_key, &mut command_rx)
                        .await;
                    self.metrics.mark_disconnected();

                    match reason {
                        CloseReason::Requested => {
                            self.set_state(SessionState::Idle);
                            self.sink.emit(EngineEvent::Disconnect {
                                stream: self.id.clone(),
                                code: Some(1000),
                            });
                            let _ = self.notice_tx.send(SessionNotice::Closed {
                                session_id: self.id.clone(),
                            });
                            return;
                        }
                        CloseReason::ServerClose(Some(1000)) => {
                            // Code 1000 is requested termination; never
                            // reconnect on it.
                            self.set_state(SessionState::Idle);
                            self.sink.emit(EngineEvent::Disconnect {
                                stream: self.id.clone(),
                                code: Some(1000),
                            });
                            let _ = self.notice_tx.send(SessionNotice::Closed {
                                session_id: self.id.clone(),
                            });
                            return;
                        }
                        CloseReason::ServerClose(code) => {
                            self.sink.emit(EngineEvent::Disconnect {
                                stream: self.id.clone(),
                                code,
                            });
                        }
                        CloseReason::Abnormal(message) => {
                            self.sink.emit(EngineEvent::Disconnect {
                                stream: self.id.clone(),
                                code: None,
                            });
                            self.metrics.record_error(&message);
                        }
                    }
                }
                Err(err) => {
                    self.metrics.record_error(&err.to_string());
                    self.sink.emit(EngineEvent::Error {
                        scope: "websocket".to_string(),
                        message: err.to_string(),
                    });
                }
            }

            // Reconnect path: back off, or give up past the attempt cap.
            attempts += 1;
            if attempts > self.config.max_reconnect_attempts {
                tracing::error!(
                    session = %self.id,
                    attempts,
                    "reconnect attempts exhausted, session failed"
                );
                self.set_state(SessionState::Failed);
                let _ = self.notice_tx.send(SessionNotice::Failed {
                    session_id: self.id.clone(),
                });
                return;
            }

            self.set_state(SessionState::Reconnecting);
            self.metrics.record_reconnect();
            let delay = backoff.next_delay();
            self.sink.emit(EngineEvent::Reconnect {
                stream: self.id.clone(),
                attempt: attempts,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                cmd = command_rx.recv() => {
                    if matches!(cmd, Some(SessionCommand::Close) | None) {
                        self.set_state(SessionState::Idle);
                        let _ = self.notice_tx.send(SessionNotice::Closed {
                            session_id: self.id.clone(),
                        });
                        return;
                    }
                    // ForceReconnect while already reconnecting: retry now.
                }
            }
        }
    }

    /// Drive one open socket until it closes. Returns why it closed.
    async fn drive_connection(
        &self,
        socket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        listen_key: &mut Option<String>,
        command_rx: &mut mpsc::UnboundedReceiver<SessionCommand>,
    ) -> CloseReason {
        let (mut write, mut read) = socket.split();
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        let mut pending_ping: Option<(u64, Instant)> = None;
        let mut ping_deadline: Option<Instant> = None;
        // Sequence tracking per key for gap counting on depth streams.
        let mut last_update_ids: HashMap<String, i64> = HashMap::new();

        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.metrics.record_message(text.len());
                        self.handle_text_frame(
                            &text,
                            &mut pending_ping,
                            &mut ping_deadline,
                            listen_key,
                            &mut last_update_ids,
                        );
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            return CloseReason::Abnormal("failed to send pong".to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code));
                        tracing::info!(session = %self.id, code = ?code, "close frame received");
                        return CloseReason::ServerClose(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return CloseReason::Abnormal(format!("read error: {err}"));
                    }
                    None => {
                        return CloseReason::Abnormal("stream ended".to_string());
                    }
                },

                _ = heartbeat.tick() => {
                    let id = PING_ID.fetch_add(1, Ordering::Relaxed);
                    let envelope = match (listen_key.as_deref(), self.config.api_key.as_deref()) {
                        (Some(lk), Some(api_key)) => json!({
                            "id": id,
                            "method": "userDataStream.ping",
                            "params": {"apiKey": api_key, "listenKey": lk}
                        }),
                        _ => json!({"id": id, "method": "ping", "params": {}}),
                    };
                    if write.send(Message::Text(envelope.to_string().into())).await.is_err() {
                        return CloseReason::Abnormal("failed to send ping".to_string());
                    }
                    pending_ping = Some((id, Instant::now()));
                    ping_deadline = Some(Instant::now() + self.config.heartbeat_timeout);
                }

                _ = async {
                    match ping_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    tracing::warn!(session = %self.id, "heartbeat timeout, forcing reconnect");
                    return CloseReason::Abnormal("heartbeat timeout".to_string());
                }

                cmd = command_rx.recv() => match cmd {
                    Some(SessionCommand::Close) | None => {
                        self.set_state(SessionState::Closing);
                        let _ = write.send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        }))).await;
                        return CloseReason::Requested;
                    }
                    Some(SessionCommand::ForceReconnect) => {
                        return CloseReason::Abnormal("reconnect forced".to_string());
                    }
                },
            }
        }
    }

    fn handle_text_frame(
        &self,
        text: &str,
        pending_ping: &mut Option<(u64, Instant)>,
        ping_deadline: &mut Option<Instant>,
        listen_key: &mut Option<String>,
        last_update_ids: &mut HashMap<String, i64>,
    ) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                self.metrics.record_error(&format!("frame parse error: {err}"));
                tracing::warn!(session = %self.id, error = %err, "unparsable frame");
                return;
            }
        };

        match classify_frame(value) {
            Frame::PingResponse {
                id,
                listen_key: new_key,
            } => {
                if let Some((pending_id, sent_at)) = pending_ping.take() {
                    if id == Some(pending_id) || id.is_none() {
                        let latency = sent_at.elapsed();
                        self.metrics.record_pong(latency);
                        self.sink.emit(EngineEvent::Heartbeat {
                            stream: self.id.clone(),
                            latency_ms: latency.as_millis() as u64,
                        });
                        *ping_deadline = None;
                    } else {
                        // Response to an older ping; keep waiting.
                        *pending_ping = Some((pending_id, sent_at));
                    }
                }
                if let Some(key) = new_key {
                    tracing::debug!(session = %self.id, "listen key observed in ping response");
                    *listen_key = Some(key);
                }
            }
            Frame::Event { key, payload } => {
                let received_at_ms = chrono::Utc::now().timestamp_millis();
                if let Some(event_time) = crate::data::decode::event_time(&payload) {
                    let age_ms = received_at_ms - event_time;
                    if age_ms > STALE_THRESHOLD_MS {
                        self.metrics.record_stale();
                        self.sink.emit(EngineEvent::StaleData {
                            stream: key.clone(),
                            age_ms,
                        });
                    }
                }
                self.track_sequence(&key, &payload, last_update_ids);
                let _ = self.events_tx.send(RawStreamEvent {
                    key,
                    payload,
                    received_at_ms,
                });
            }
            Frame::Unknown => {
                tracing::debug!(session = %self.id, "ignoring unrecognized frame shape");
            }
        }
    }

    /// Count gaps on depth streams using the previous-final-update-id
    /// chain when the payload carries one.
    fn track_sequence(
        &self,
        key: &str,
        payload: &Value,
        last_update_ids: &mut HashMap<String, i64>,
    ) {
        let final_id = match payload.get("u").and_then(Value::as_i64) {
            Some(id) => id,
            None => return,
        };
        if let Some(prev_expected) = payload.get("pu").and_then(Value::as_i64) {
            if let Some(last) = last_update_ids.get(key) {
                if *last != prev_expected {
                    self.metrics.record_data_gap();
                    tracing::warn!(
                        stream = %key,
                        expected = prev_expected,
                        last = *last,
                        "gap in depth updates detected"
                    );
                }
            }
        }
        last_update_ids.insert(key.to_string(), final_id);
    }
}

/// Classify an inbound frame: ping response, combined-stream envelope, or
/// single-stream event.
fn classify_frame(value: Value) -> Frame {
    if value.get("result").is_some() && value.get("id").is_some() {
        let id = value.get("id").and_then(Value::as_u64);
        let listen_key = value
            .get("result")
            .and_then(|r| r.get("listenKey"))
            .and_then(Value::as_str)
            .map(str::to_string);
        return Frame::PingResponse { id, listen_key };
    }
    if let (Some(stream), Some(payload)) = (
        value.get("stream").and_then(Value::as_str).map(str::to_string),
        value.get("data").cloned(),
    ) {
        return Frame::Event {
            key: stream,
            payload,
        };
    }
    if value.get("e").is_some() {
        if let Some(key) = stream_key_from_event(&value) {
            return Frame::Event {
                key,
                payload: value,
            };
        }
    }
    Frame::Unknown
}

/// Derive the stream key of a single-stream event from its `e`/`s`
/// fields (plus the kline interval when applicable).
fn stream_key_from_event(value: &Value) -> Option<String> {
    let event_type = value.get("e")?.as_str()?;
    let symbol = value.get("s")?.as_str()?.to_lowercase();
    let key = match event_type {
        "bookTicker" => format!("{symbol}@bookTicker"),
        "depthUpdate" => format!("{symbol}@depth"),
        "aggTrade" => format!("{symbol}@aggTrade"),
        "trade" => format!("{symbol}@trade"),
        "24hrTicker" => format!("{symbol}@ticker"),
        "kline" => {
            let interval = value.get("k")?.get("i")?.as_str()?;
            format!("{symbol}@kline_{interval}")
        }
        _ => return None,
    };
    Some(key)
}
