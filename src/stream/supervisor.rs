//! Supervisor owning every push session.
//!
//! Keeps the callback registry and the session map, trips a per-endpoint
//! circuit breaker on repeated session failures, and revives sessions for
//! registered keys when the breaker allows. Callbacks are invoked from a
//! single dispatcher task with no supervisor lock held.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::data::key::StreamKey;
use crate::error::MarketError;
use crate::events::SharedSink;
use crate::retry::{BreakerConfig, BreakerState, CircuitBreaker};
use crate::stream::metrics::StreamMetricsSnapshot;
use crate::stream::session::{
    session_id, spawn_session, RawStreamEvent, SessionConfig, SessionHandle, SessionNotice,
    SessionState,
};

/// How often the supervisor tries to revive sessions for registered keys
/// that have none (after failures or while the breaker was open).
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// How long `disconnect_all` waits for each socket to acknowledge close.
const CLOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Callback receiving raw push events for registered keys.
pub type RawCallback = Arc<dyn Fn(RawStreamEvent) + Send + Sync>;

/// Aggregate connection status over all sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStatus {
    Connected,
    Connecting,
    Disconnected,
    Reconnecting,
    Failed,
}

struct Registration {
    id: u64,
    keys: Vec<StreamKey>,
    key_strings: Vec<String>,
    callback: RawCallback,
}

/// Owns sessions and fans raw events out to registered callbacks.
pub struct StreamSupervisor {
    config: SessionConfig,
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    registrations: RwLock<Vec<Registration>>,
    /// Session ids that ended with a normal close (code 1000). These are
    /// not revived; only an explicit subscribe reopens them.
    closed_normally: RwLock<HashSet<String>>,
    next_registration_id: AtomicU64,
    breaker: CircuitBreaker,
    sink: SharedSink,
    events_tx: mpsc::UnboundedSender<RawStreamEvent>,
    notice_tx: mpsc::UnboundedSender<SessionNotice>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamSupervisor {
    pub fn new(config: SessionConfig, breaker_config: BreakerConfig, sink: SharedSink) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let supervisor = Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            registrations: RwLock::new(Vec::new()),
            closed_normally: RwLock::new(HashSet::new()),
            next_registration_id: AtomicU64::new(1),
            breaker: CircuitBreaker::new(breaker_config),
            sink,
            events_tx,
            notice_tx,
            tasks: Mutex::new(Vec::new()),
        });
        supervisor.spawn_background(events_rx, notice_rx);
        supervisor
    }

    fn spawn_background(
        self: &Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<RawStreamEvent>,
        mut notice_rx: mpsc::UnboundedReceiver<SessionNotice>,
    ) {
        let dispatcher = {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    supervisor.dispatch(event);
                }
            })
        };
        let notices = {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(notice) = notice_rx.recv().await {
                    supervisor.handle_notice(notice);
                }
            })
        };
        let maintenance = {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    supervisor.revive_sessions();
                }
            })
        };
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(dispatcher);
        tasks.push(notices);
        tasks.push(maintenance);
    }

    /// Register a callback for a key set without touching sessions.
    /// Returns the registration id used for unregistering.
    pub fn register(&self, keys: Vec<StreamKey>, callback: RawCallback) -> u64 {
        let id = self.next_registration_id.fetch_add(1, Ordering::Relaxed);
        let key_strings = keys.iter().map(|k| k.to_string()).collect();
        self.registrations.write().unwrap().push(Registration {
            id,
            keys,
            key_strings,
            callback,
        });
        id
    }

    /// Subscribe to a single stream: register the callback and make sure
    /// a session exists for the key (breaker permitting).
    pub fn subscribe_to_stream(&self, key: &StreamKey, callback: RawCallback) -> u64 {
        let id = self.register(vec![key.clone()], callback);
        self.ensure_session(std::slice::from_ref(key));
        id
    }

    /// Subscribe to several streams over one combined session.
    pub fn connect_to_streams(&self, keys: &[StreamKey], callback: RawCallback) -> u64 {
        let id = self.register(keys.to_vec(), callback);
        self.ensure_session(keys);
        id
    }

    /// Drop a registration. Keys with no remaining callbacks are
    /// withdrawn; sessions with an empty callback set close with 1000.
    ///
    /// Idempotent: unknown ids are ignored.
    pub fn unregister(&self, registration_id: u64) {
        {
            let mut registrations = self.registrations.write().unwrap();
            registrations.retain(|r| r.id != registration_id);
        }
        self.close_orphan_sessions();
    }

    fn close_orphan_sessions(&self) {
        let registrations = self.registrations.read().unwrap();
        let sessions = self.sessions.read().unwrap();
        for handle in sessions.values() {
            let referenced = handle.keys().iter().any(|key| {
                let key = key.to_string();
                registrations.iter().any(|r| r.key_strings.contains(&key))
            });
            if !referenced {
                tracing::info!(session = %handle.id(), "last callback removed, closing session");
                handle.close();
            }
        }
    }

    /// Make sure a live session exists for a key set. Skipped while the
    /// breaker rejects new connections; the maintenance task retries.
    fn ensure_session(&self, keys: &[StreamKey]) {
        let id = session_id(keys);
        self.closed_normally.write().unwrap().remove(&id);
        {
            let sessions = self.sessions.read().unwrap();
            if let Some(handle) = sessions.get(&id) {
                if handle.state() != SessionState::Failed {
                    return;
                }
            }
        }
        if let Err(err) = self.breaker.try_acquire("websocket") {
            tracing::warn!(session = %id, error = %err, "not opening session, circuit open");
            return;
        }

        let mut sessions = self.sessions.write().unwrap();
        // Double-check after taking the write lock.
        if let Some(handle) = sessions.get(&id) {
            if handle.state() != SessionState::Failed {
                return;
            }
        }
        let handle = spawn_session(
            keys.to_vec(),
            self.config.clone(),
            self.events_tx.clone(),
            self.notice_tx.clone(),
            Arc::clone(&self.sink),
        );
        sessions.insert(id, handle);
    }

    /// Re-open sessions for registered keys that lost theirs.
    fn revive_sessions(&self) {
        let wanted: Vec<Vec<StreamKey>> = {
            let registrations = self.registrations.read().unwrap();
            registrations.iter().map(|r| r.keys.clone()).collect()
        };
        for keys in wanted {
            if keys.is_empty() {
                continue;
            }
            let id = session_id(&keys);
            if self.closed_normally.read().unwrap().contains(&id) {
                continue;
            }
            let missing = {
                let sessions = self.sessions.read().unwrap();
                match sessions.get(&id) {
                    Some(handle) => handle.state() == SessionState::Failed,
                    None => true,
                }
            };
            if missing {
                self.ensure_session(&keys);
            }
        }
    }

    /// Fan one raw event out to every registration covering its key.
    pub(crate) fn dispatch(&self, event: RawStreamEvent) {
        let callbacks: Vec<RawCallback> = {
            let registrations = self.registrations.read().unwrap();
            registrations
                .iter()
                .filter(|r| r.key_strings.iter().any(|k| k == &event.key))
                .map(|r| Arc::clone(&r.callback))
                .collect()
        };
        // Invoked with no supervisor lock held.
        for callback in callbacks {
            callback(event.clone());
        }
    }

    fn handle_notice(&self, notice: SessionNotice) {
        match notice {
            SessionNotice::Opened { session_id } => {
                tracing::debug!(session = %session_id, "session opened");
                self.breaker.record_success();
            }
            SessionNotice::Failed { session_id } => {
                tracing::warn!(session = %session_id, "session failed");
                self.breaker.record_failure();
                self.sessions.write().unwrap().remove(&session_id);
            }
            SessionNotice::Closed { session_id } => {
                self.sessions.write().unwrap().remove(&session_id);
                self.closed_normally.write().unwrap().insert(session_id);
            }
        }
    }

    /// Close all sessions without marking intentional, triggering a full
    /// reconnection pass.
    pub fn force_reconnect(&self) {
        let sessions = self.sessions.read().unwrap();
        for handle in sessions.values() {
            handle.force_reconnect();
        }
    }

    /// Close every session with code 1000, clear callbacks and keys, and
    /// wait for sockets to acknowledge. Idempotent.
    pub async fn disconnect_all(&self) {
        self.registrations.write().unwrap().clear();
        self.closed_normally.write().unwrap().clear();
        let handles: Vec<Arc<SessionHandle>> = {
            let mut sessions = self.sessions.write().unwrap();
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in &handles {
            handle.close();
        }
        for handle in &handles {
            handle.join(CLOSE_JOIN_TIMEOUT).await;
        }
    }

    /// Aggregate status over all sessions.
    pub fn status(&self) -> SupervisorStatus {
        let sessions = self.sessions.read().unwrap();
        let states: Vec<SessionState> = sessions.values().map(|h| h.state()).collect();
        if states.is_empty() {
            return SupervisorStatus::Disconnected;
        }
        if states.iter().all(|s| *s == SessionState::Failed) {
            return SupervisorStatus::Failed;
        }
        if states.iter().any(|s| *s == SessionState::Reconnecting) {
            return SupervisorStatus::Reconnecting;
        }
        if states.iter().any(|s| *s == SessionState::Connecting) {
            return SupervisorStatus::Connecting;
        }
        if states.iter().any(|s| *s == SessionState::Open) {
            return SupervisorStatus::Connected;
        }
        SupervisorStatus::Disconnected
    }

    /// Per-session metrics snapshots, keyed by session id.
    pub fn metrics(&self) -> HashMap<String, StreamMetricsSnapshot> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .iter()
            .map(|(id, handle)| (id.clone(), handle.metrics().snapshot()))
            .collect()
    }

    /// Whether push delivery is currently healthy for a key: breaker
    /// closed and an open session carrying the key.
    pub fn push_available(&self, key: &StreamKey) -> bool {
        if self.breaker.state() != BreakerState::Closed {
            return false;
        }
        let sessions = self.sessions.read().unwrap();
        sessions
            .values()
            .any(|h| h.keys().contains(key) && h.state() == SessionState::Open)
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Force the circuit breaker from Open back to Closed.
    pub fn reset_circuit_breaker(&self) {
        self.breaker.force_close();
    }

    /// Permission check used before opening sessions; exposed for the
    /// fallback path to report a typed error.
    pub fn check_breaker(&self) -> Result<(), MarketError> {
        match self.breaker.state() {
            BreakerState::Closed => Ok(()),
            _ => Err(MarketError::circuit_open("websocket")),
        }
    }

    /// Stop background tasks. Sessions should be closed first via
    /// `disconnect_all`.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::key::Topic;
    use crate::events::TracingSink;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn test_config(ws_base_url: &str) -> SessionConfig {
        SessionConfig {
            ws_base_url: ws_base_url.to_string(),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            backoff_factor: 2.0,
            max_reconnect_attempts: 1,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            api_key: None,
        }
    }

    fn supervisor(ws_base_url: &str, threshold: u32) -> Arc<StreamSupervisor> {
        StreamSupervisor::new(
            test_config(ws_base_url),
            BreakerConfig {
                failure_threshold: threshold,
                failure_window: Duration::from_secs(60),
                reset_timeout: Duration::from_secs(300),
            },
            Arc::new(TracingSink),
        )
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_key() {
        let supervisor = supervisor("ws://127.0.0.1:1", 5);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        supervisor.register(
            vec![StreamKey::new("btcusdt", Topic::BookTicker)],
            Arc::new(move |event| {
                assert_eq!(event.key, "btcusdt@bookTicker");
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        supervisor.dispatch(RawStreamEvent {
            key: "btcusdt@bookTicker".to_string(),
            payload: json!({}),
            received_at_ms: 0,
        });
        supervisor.dispatch(RawStreamEvent {
            key: "ethusdt@bookTicker".to_string(),
            payload: json!({}),
            received_at_ms: 0,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_combined_registration_receives_member_keys() {
        let supervisor = supervisor("ws://127.0.0.1:1", 5);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        supervisor.register(
            vec![
                StreamKey::new("btcusdt", Topic::BookTicker),
                StreamKey::new("ethusdt", Topic::Ticker),
            ],
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        supervisor.dispatch(RawStreamEvent {
            key: "ethusdt@ticker".to_string(),
            payload: json!({}),
            received_at_ms: 0,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let supervisor = supervisor("ws://127.0.0.1:1", 5);
        let id = supervisor.register(
            vec![StreamKey::new("btcusdt", Topic::Trade)],
            Arc::new(|_| {}),
        );
        supervisor.unregister(id);
        supervisor.unregister(id);
        assert_eq!(supervisor.registrations.read().unwrap().len(), 0);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_failed_sessions_trip_breaker() {
        // Port 1 refuses connections immediately; one reconnect attempt
        // then the session fails, and a single failure trips the breaker.
        let supervisor = supervisor("ws://127.0.0.1:1", 1);
        let key = StreamKey::new("btcusdt", Topic::BookTicker);
        supervisor.subscribe_to_stream(&key, Arc::new(|_| {}));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while supervisor.breaker_state() != BreakerState::Open {
            assert!(
                tokio::time::Instant::now() < deadline,
                "breaker did not open in time"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!supervisor.push_available(&key));
        assert!(supervisor.check_breaker().is_err());

        supervisor.reset_circuit_breaker();
        assert_eq!(supervisor.breaker_state(), BreakerState::Closed);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_all_is_idempotent() {
        let supervisor = supervisor("ws://127.0.0.1:1", 5);
        supervisor.disconnect_all().await;
        supervisor.disconnect_all().await;
        assert_eq!(supervisor.status(), SupervisorStatus::Disconnected);
        supervisor.shutdown();
    }

    #[tokio::test]
    async fn test_status_empty_is_disconnected() {
        let supervisor = supervisor("ws://127.0.0.1:1", 5);
        assert_eq!(supervisor.status(), SupervisorStatus::Disconnected);
        supervisor.shutdown();
    }
}
