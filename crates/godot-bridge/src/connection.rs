//! Connection lifecycle
//!
//! A [`Connection`] owns the transport of one channel and the three
//! per-channel tables: pending requests, resource lanes and the event
//! dispatcher. Each established transport gets a generation number; the
//! background reader and heartbeat tasks carry it so a stale task can never
//! tear down a newer connection.

use crate::classify::{Route, classify};
use crate::dialect::Dialect;
use crate::events::EventDispatcher;
use crate::lanes::ResourceQueue;
use crate::pending::{Correlator, PendingSummary};
use crate::transport::{EnvelopeSink, FrameReader, FrameWriter, Inbound};
use async_trait::async_trait;
use godot_bridge_core::{BridgeError, Envelope, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Event a peer may send to announce itself
pub const HANDSHAKE_EVENT: &str = "handshake";

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

/// What we know about the remote peer
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerInfo {
    /// Remote socket address
    pub address: String,
    /// Project directory the peer reported, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    /// Handshake details (adapter capabilities, plugin version)
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl PeerInfo {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }
}

/// Point-in-time view of a channel
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub channel: &'static str,
    pub state: ConnectionState,
    pub generation: u64,
    pub peer: Option<PeerInfo>,
    pub attached: bool,
    pub pending: Vec<PendingSummary>,
    pub active_lanes: usize,
    pub buffered_output: usize,
    /// Milliseconds since the last heartbeat acknowledgment
    pub last_heartbeat_ms: Option<u64>,
}

/// Tunables for a connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub heartbeat_interval: Option<Duration>,
    pub output_capacity: usize,
}

#[derive(Default)]
struct Session {
    generation: u64,
    peer: Option<PeerInfo>,
    last_heartbeat: Option<Instant>,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    dialect: Dialect,
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Session>,
    writer: tokio::sync::Mutex<Option<Box<dyn FrameWriter>>>,
    correlator: Correlator,
    lanes: ResourceQueue,
    events: EventDispatcher,
}

/// Owns one channel's transport and in-flight state
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(dialect: Dialect, options: ConnectionOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                dialect,
                events: EventDispatcher::new(dialect.label(), options.output_capacity),
                options,
                state,
                session: Mutex::new(Session::default()),
                writer: tokio::sync::Mutex::new(None),
                correlator: Correlator::new(),
                lanes: ResourceQueue::new(),
            }),
        }
    }

    pub fn channel(&self) -> &'static str {
        self.shared.dialect.label()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.shared.events
    }

    pub fn lanes(&self) -> &ResourceQueue {
        &self.shared.lanes
    }

    pub fn correlator(&self) -> &Correlator {
        &self.shared.correlator
    }

    pub fn peer(&self) -> Option<PeerInfo> {
        self.shared.session().peer.clone()
    }

    /// Record handshake details learned after the transport came up
    pub fn update_peer(&self, update: impl FnOnce(&mut PeerInfo)) {
        if let Some(peer) = self.shared.session().peer.as_mut() {
            update(peer);
        }
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.shared.session().last_heartbeat
    }

    /// Generation of the most recently established transport
    pub fn generation(&self) -> u64 {
        self.shared.session().generation
    }

    /// Move `disconnected → connecting`. False if the channel is not idle.
    pub fn begin_connecting(&self) -> bool {
        let _session = self.shared.session();
        self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        })
    }

    /// Give up a connect attempt started with [`begin_connecting`](Self::begin_connecting)
    pub fn abort_connecting(&self) {
        let _session = self.shared.session();
        self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }

    /// Install a live transport and start its background tasks
    pub async fn establish(
        &self,
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
        peer: PeerInfo,
    ) -> u64 {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Draining
        ) {
            self.teardown("replaced by a new connection").await;
        }

        *self.shared.writer.lock().await = Some(writer);

        let generation = {
            let mut session = self.shared.session();
            session.generation += 1;
            session.peer = Some(peer.clone());
            session.last_heartbeat = None;
            self.shared.state.send_replace(ConnectionState::Connected);

            let generation = session.generation;
            session
                .tasks
                .push(tokio::spawn(read_loop(self.shared.clone(), reader, generation)));
            if let Some(period) = self.shared.options.heartbeat_interval {
                session
                    .tasks
                    .push(tokio::spawn(heartbeat_loop(self.shared.clone(), period)));
            }
            generation
        };

        info!(
            "[{}] Connected to {} (generation {})",
            self.channel(),
            peer.address,
            generation
        );
        generation
    }

    /// Send a request and wait for its response
    pub async fn request(&self, operation: &str, payload: Value, timeout: Duration) -> Result<Value> {
        if !self.is_connected() {
            return Err(BridgeError::TransportUnavailable(format!(
                "{} channel is {:?}",
                self.channel(),
                self.state()
            )));
        }
        self.shared
            .correlator
            .send(&*self.shared, operation, payload, timeout)
            .await
    }

    /// Close the write side; the reader notices the peer closing in turn
    pub async fn close_transport(&self) {
        // A write in progress may be stalled on the peer; teardown still runs
        let Ok(mut guard) = self.shared.writer.try_lock() else {
            debug!("[{}] Writer busy, skipping close", self.channel());
            return;
        };
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = writer.close().await {
                debug!("[{}] Close failed: {}", self.channel(), e);
            }
        }
    }

    /// Tear the connection down, failing everything still outstanding.
    /// Safe to call repeatedly.
    pub async fn teardown(&self, reason: &str) -> bool {
        self.shared.teardown(None, reason).await
    }

    pub fn status(&self) -> ConnectionStatus {
        let (generation, peer, last_heartbeat) = {
            let session = self.shared.session();
            (session.generation, session.peer.clone(), session.last_heartbeat)
        };
        ConnectionStatus {
            channel: self.channel(),
            state: self.state(),
            generation,
            peer,
            attached: self.shared.events.is_attached(),
            pending: self.shared.correlator.pending_requests(),
            active_lanes: self.shared.lanes.lane_count(),
            buffered_output: self.shared.events.buffered_output(false).len(),
            last_heartbeat_ms: last_heartbeat.map(|t| t.elapsed().as_millis() as u64),
        }
    }
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tear down if `generation` (when given) is still the live one
    async fn teardown(&self, generation: Option<u64>, reason: &str) -> bool {
        let tasks = {
            let mut session = self.session();
            if generation.is_some_and(|g| g != session.generation) {
                return false;
            }
            if matches!(
                *self.state.borrow(),
                ConnectionState::Disconnected | ConnectionState::Connecting
            ) {
                return false;
            }
            self.state.send_replace(ConnectionState::Draining);
            session.peer = None;
            session.last_heartbeat = None;
            std::mem::take(&mut session.tasks)
        };

        let failed = self.correlator.invalidate_all(reason);
        self.lanes.clear();
        self.events.reset();
        // Never wait on the writer here. A stalled holder gives the lock up
        // at its own deadline or when its task is aborted below, and the
        // stale writer is replaced by the next `establish`.
        match self.writer.try_lock() {
            Ok(mut guard) => drop(guard.take()),
            Err(_) => debug!("[{}] Writer busy during teardown", self.dialect.label()),
        }

        self.state.send_replace(ConnectionState::Disconnected);
        info!(
            "[{}] Disconnected: {} ({} requests failed)",
            self.dialect.label(),
            reason,
            failed
        );

        // May abort the calling task itself, so nothing is awaited after this
        for task in tasks {
            task.abort();
        }
        true
    }

    /// Route one inbound document
    fn route(&self, doc: Value) {
        let Some(envelope) = self.dialect.decode(doc) else {
            return;
        };
        let name = envelope.name().to_string();

        match classify(envelope) {
            Route::Resolve { id, outcome } => {
                if !self.correlator.resolve(id, outcome) {
                    warn!(
                        "[{}] Dropping late or duplicate response {} ({})",
                        self.dialect.label(),
                        id,
                        name
                    );
                }
            }
            Route::Dispatch { name, payload } => {
                if name == HANDSHAKE_EVENT {
                    self.record_handshake(&payload);
                }
                self.events.dispatch(&name, &payload);
            }
            Route::Drop { reason } => {
                warn!("[{}] Dropping message: {}", self.dialect.label(), reason);
            }
        }
    }

    fn record_handshake(&self, payload: &Value) {
        let mut session = self.session();
        if let Some(peer) = session.peer.as_mut() {
            peer.project_path = ["projectPath", "project_path"]
                .iter()
                .find_map(|key| payload.get(key).and_then(Value::as_str))
                .map(str::to_string);
            peer.details = payload.clone();
            info!(
                "[{}] Peer handshake: project {:?}",
                self.dialect.label(),
                peer.project_path
            );
        }
    }

    fn touch_heartbeat(&self, generation: u64) {
        let mut session = self.session();
        if session.generation == generation {
            session.last_heartbeat = Some(Instant::now());
        }
    }
}

#[async_trait]
impl EnvelopeSink for Shared {
    async fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let Envelope::Request {
            id: Some(id),
            operation,
            payload,
        } = envelope
        else {
            return Err(BridgeError::Protocol(format!(
                "only requests are sent, got {}",
                envelope.name()
            )));
        };
        let id = id
            .sequence()
            .ok_or_else(|| BridgeError::Protocol(format!("non-numeric request id {}", id)))?;
        let doc = self.dialect.encode_request(id, operation, payload);

        let mut guard = self.writer.lock().await;
        if *self.state.borrow() != ConnectionState::Connected {
            return Err(BridgeError::TransportUnavailable(format!(
                "{} channel is not connected",
                self.dialect.label()
            )));
        }
        let writer = guard.as_mut().ok_or_else(|| {
            BridgeError::TransportUnavailable(format!("{} channel has no writer", self.dialect.label()))
        })?;
        writer.write_document(&doc).await
    }
}

/// Background reader: decode, classify, resolve or dispatch
async fn read_loop(shared: Arc<Shared>, mut reader: Box<dyn FrameReader>, generation: u64) {
    loop {
        match reader.read_batch().await {
            Ok(Inbound::Documents(docs)) => {
                for doc in docs {
                    shared.route(doc);
                }
            }
            Ok(Inbound::Liveness) => shared.touch_heartbeat(generation),
            Err(e) => {
                match &e {
                    BridgeError::TransportClosed(_) => {
                        info!("[{}] Reader stopped: {}", shared.dialect.label(), e)
                    }
                    _ => error!("[{}] Reader task failed: {}", shared.dialect.label(), e),
                }
                shared.teardown(Some(generation), &e.to_string()).await;
                break;
            }
        }
    }
}

/// Periodic liveness ping; missed acknowledgments are only recorded
async fn heartbeat_loop(shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    // First tick fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut guard = shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            break;
        };
        if let Err(e) = writer.heartbeat().await {
            debug!("[{}] Heartbeat failed: {}", shared.dialect.label(), e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// In-memory peer: documents written by the bridge arrive on `sent`,
    /// documents pushed on `inbound` are read by the bridge.
    struct ChannelReader(mpsc::UnboundedReceiver<Inbound>);

    #[async_trait]
    impl FrameReader for ChannelReader {
        async fn read_batch(&mut self) -> Result<Inbound> {
            self.0
                .recv()
                .await
                .ok_or_else(|| BridgeError::TransportClosed("test peer hung up".into()))
        }
    }

    struct ChannelWriter {
        sent: mpsc::UnboundedSender<Value>,
        pings: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl FrameWriter for ChannelWriter {
        async fn write_document(&mut self, doc: &Value) -> Result<()> {
            self.sent
                .send(doc.clone())
                .map_err(|_| BridgeError::TransportUnavailable("test peer gone".into()))
        }

        async fn heartbeat(&mut self) -> Result<()> {
            *self.pings.lock().unwrap() += 1;
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Accepts the write and never finishes it
    struct StalledWriter;

    #[async_trait]
    impl FrameWriter for StalledWriter {
        async fn write_document(&mut self, _doc: &Value) -> Result<()> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct TestPeer {
        inbound: mpsc::UnboundedSender<Inbound>,
        sent: mpsc::UnboundedReceiver<Value>,
        pings: Arc<Mutex<usize>>,
    }

    impl TestPeer {
        fn reply(&self, doc: Value) {
            self.inbound.send(Inbound::Documents(vec![doc])).unwrap();
        }
    }

    async fn connected(dialect: Dialect, heartbeat: Option<Duration>) -> (Connection, TestPeer) {
        let connection = Connection::new(
            dialect,
            ConnectionOptions {
                heartbeat_interval: heartbeat,
                output_capacity: 100,
            },
        );
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent) = mpsc::unbounded_channel();
        let pings = Arc::new(Mutex::new(0));
        connection
            .establish(
                Box::new(ChannelReader(inbound_rx)),
                Box::new(ChannelWriter {
                    sent: sent_tx,
                    pings: pings.clone(),
                }),
                PeerInfo::new("test"),
            )
            .await;
        (
            connection,
            TestPeer {
                inbound,
                sent,
                pings,
            },
        )
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (connection, mut peer) = connected(Dialect::EditorTool, None).await;

        let conn = connection.clone();
        let call = tokio::spawn(async move {
            conn.request("get_scene_tree", json!({}), Duration::from_secs(5))
                .await
        });

        let request = peer.sent.recv().await.unwrap();
        assert_eq!(request["command"], "get_scene_tree");
        peer.reply(json!({
            "type": "response", "id": request["id"], "success": true, "result": {"root": "Main"}
        }));

        assert_eq!(call.await.unwrap().unwrap(), json!({"root": "Main"}));
    }

    #[tokio::test]
    async fn test_peer_close_fails_outstanding_requests() {
        let (connection, mut peer) = connected(Dialect::DebugAdapter, None).await;

        let calls: Vec<_> = (0..4)
            .map(|i| {
                let conn = connection.clone();
                tokio::spawn(async move {
                    conn.request(&format!("op{}", i), Value::Null, Duration::from_secs(30))
                        .await
                })
            })
            .collect();
        for _ in 0..4 {
            peer.sent.recv().await.unwrap();
        }

        drop(peer.inbound);
        for call in calls {
            assert!(matches!(
                call.await.unwrap(),
                Err(BridgeError::TransportClosed(_))
            ));
        }
        assert_eq!(connection.correlator().pending_count(), 0);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(connection.peer().is_none());
    }

    #[tokio::test]
    async fn test_request_while_disconnected() {
        let connection = Connection::new(
            Dialect::EditorTool,
            ConnectionOptions {
                heartbeat_interval: None,
                output_capacity: 10,
            },
        );
        let err = connection
            .request("get_scene_tree", Value::Null, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::TransportUnavailable(_)));
    }

    #[tokio::test]
    async fn test_events_and_handshake_routed() {
        let (connection, peer) = connected(Dialect::EditorTool, None).await;

        peer.reply(json!({
            "type": "event", "event": "handshake",
            "data": {"projectPath": "/home/dev/game", "version": "4.3"}
        }));
        peer.reply(json!({"type": "event", "event": "output", "data": {"text": "ready"}}));
        // Unmatched response and garbage are dropped without disturbing anything
        peer.reply(json!({"type": "response", "id": 99, "success": true}));
        peer.reply(json!({"type": "mystery"}));

        let mut rx = connection.events().subscribe();
        peer.reply(json!({"type": "event", "event": "sync"}));
        rx.recv().await.unwrap();

        assert_eq!(
            connection.peer().unwrap().project_path.as_deref(),
            Some("/home/dev/game")
        );
        assert_eq!(connection.events().buffered_output(false), vec!["ready"]);
        assert!(connection.is_connected());
    }

    #[tokio::test]
    async fn test_heartbeat_and_liveness() {
        let (connection, peer) = connected(Dialect::EditorTool, Some(Duration::from_millis(10))).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(*peer.pings.lock().unwrap() >= 2);

        assert!(connection.last_heartbeat().is_none());
        peer.inbound.send(Inbound::Liveness).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(connection.last_heartbeat().is_some());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent_and_clears_lanes() {
        let (connection, _peer) = connected(Dialect::EditorTool, None).await;
        let _ticket = connection.lanes().ticket(Some("res://main.tscn"));
        assert_eq!(connection.lanes().lane_count(), 1);

        assert!(connection.teardown("operator request").await);
        assert!(!connection.teardown("operator request").await);
        assert_eq!(connection.lanes().lane_count(), 0);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stale_generation_cannot_tear_down() {
        let (connection, old_peer) = connected(Dialect::EditorTool, None).await;
        connection.teardown("reconnecting").await;

        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, _sent) = mpsc::unbounded_channel();
        connection
            .establish(
                Box::new(ChannelReader(inbound_rx)),
                Box::new(ChannelWriter {
                    sent: sent_tx,
                    pings: Arc::new(Mutex::new(0)),
                }),
                PeerInfo::new("second"),
            )
            .await;

        assert!(!connection.shared.teardown(Some(1), "stale").await);
        drop(old_peer);
        tokio::task::yield_now().await;
        assert!(connection.is_connected());
        assert_eq!(connection.peer().unwrap().address, "second");
        drop(inbound);
    }

    #[tokio::test]
    async fn test_stalled_writer_cannot_wedge_connection() {
        let connection = Connection::new(
            Dialect::DebugAdapter,
            ConnectionOptions {
                heartbeat_interval: None,
                output_capacity: 10,
            },
        );
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        connection
            .establish(
                Box::new(ChannelReader(inbound_rx)),
                Box::new(StalledWriter),
                PeerInfo::new("wedged"),
            )
            .await;

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            connection.request("threads", Value::Null, Duration::from_millis(100)),
        )
        .await
        .expect("request should settle within its own deadline");
        assert!(matches!(result, Err(BridgeError::RequestTimeout { .. })));
        assert_eq!(connection.correlator().pending_count(), 0);

        // A second caller is parked in the write when teardown runs
        let conn = connection.clone();
        let stuck = tokio::spawn(async move {
            conn.request("stackTrace", Value::Null, Duration::from_secs(30))
                .await
        });
        while connection.correlator().pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        let torn_down = tokio::time::timeout(Duration::from_secs(2), async {
            connection.close_transport().await;
            connection.teardown("peer stopped reading").await
        })
        .await
        .expect("teardown should not wait on the writer");
        assert!(torn_down);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            stuck.await.unwrap(),
            Err(BridgeError::TransportClosed(_))
        ));

        assert!(connection.begin_connecting());
        let (sent_tx, mut sent) = mpsc::unbounded_channel();
        let (_inbound, inbound_rx) = mpsc::unbounded_channel();
        tokio::time::timeout(
            Duration::from_secs(2),
            connection.establish(
                Box::new(ChannelReader(inbound_rx)),
                Box::new(ChannelWriter {
                    sent: sent_tx,
                    pings: Arc::new(Mutex::new(0)),
                }),
                PeerInfo::new("recovered"),
            ),
        )
        .await
        .unwrap();
        let conn = connection.clone();
        tokio::spawn(async move {
            conn.request("threads", Value::Null, Duration::from_secs(5))
                .await
        });
        assert_eq!(sent.recv().await.unwrap()["command"], "threads");
        drop(inbound);
    }
}
