//! Editor plugin bridge
//!
//! The Godot editor plugin dials in to a WebSocket server run by the bridge.
//! Exactly one plugin is served at a time; later peers are turned away with
//! close code 4000 while the active one stays untouched.

use crate::connection::{Connection, ConnectionOptions, ConnectionState, ConnectionStatus, PeerInfo};
use crate::dialect::Dialect;
use crate::events::BridgeEvent;
use crate::ws::{WsReadWrapper, WsWriteWrapper, reject_busy};
use futures_util::StreamExt;
use godot_bridge_core::{BridgeError, EditorConfig, Result};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Arguments that name the scene or resource a command touches, in
/// precedence order
pub const LANE_KEY_FIELDS: [&str; 7] = [
    "scene_path",
    "scenePath",
    "resource_path",
    "resourcePath",
    "script_path",
    "scriptPath",
    "path",
];

/// Lane key for an editor command: the first resource path in its arguments
pub fn lane_key(params: &Value) -> Option<String> {
    LANE_KEY_FIELDS
        .iter()
        .find_map(|field| params.get(field).and_then(Value::as_str))
        .filter(|path| !path.is_empty())
        .map(str::to_string)
}

/// Tasks still upgrading or installing an accepted peer
type PeerTasks = Arc<Mutex<JoinSet<()>>>;

struct Listener {
    addr: SocketAddr,
    task: JoinHandle<()>,
    peers: PeerTasks,
}

/// WebSocket server the editor plugin connects to
pub struct EditorBridge {
    config: EditorConfig,
    connection: Connection,
    listener: Mutex<Option<Listener>>,
}

impl EditorBridge {
    pub fn new(config: EditorConfig) -> Self {
        let connection = Connection::new(
            Dialect::EditorTool,
            ConnectionOptions {
                heartbeat_interval: config.heartbeat_interval,
                output_capacity: config.output_capacity,
            },
        );
        Self {
            config,
            connection,
            listener: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Bind the server and start accepting plugin connections.
    /// Returns the bound address; calling it again is a no-op.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let addr = self.config.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BridgeError::ConnectFailed {
                addr: addr.clone(),
                reason: format!("bind failed: {}", e),
            })?;
        let bound = listener
            .local_addr()
            .map_err(|e| BridgeError::ConnectFailed {
                addr,
                reason: e.to_string(),
            })?;

        let mut slot = self.listener();
        if let Some(existing) = slot.as_ref() {
            // Lost a race with a concurrent start; keep the first server
            return Ok(existing.addr);
        }
        let peers = PeerTasks::default();
        let task = tokio::spawn(accept_loop(
            listener,
            self.connection.clone(),
            self.config.handshake_timeout,
            peers.clone(),
        ));
        *slot = Some(Listener {
            addr: bound,
            task,
            peers,
        });
        info!("Editor bridge listening on ws://{}", bound);
        Ok(bound)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener().as_ref().map(|listener| listener.addr)
    }

    /// Run an editor command. Waits up to the connect timeout for the
    /// plugin, and serializes commands that touch the same resource.
    pub fn invoke<'a>(
        &'a self,
        command: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value>> + Send + 'a {
        let key = lane_key(&params);
        let ticket = self.connection.lanes().ticket(key.as_deref());
        let command = command.to_string();
        async move {
            ticket
                .run(move || async move {
                    self.wait_for_peer().await?;
                    self.connection
                        .request(&command, params, self.config.request_timeout)
                        .await
                })
                .await
        }
    }

    async fn wait_for_peer(&self) -> Result<()> {
        if self.connection.is_connected() {
            return Ok(());
        }
        debug!("Waiting up to {:?} for the editor plugin", self.config.connect_timeout);
        let mut state = self.connection.subscribe_state();
        let connected = tokio::time::timeout(
            self.config.connect_timeout,
            state.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await
        .is_ok_and(|changed| changed.is_ok());
        if connected {
            Ok(())
        } else {
            Err(BridgeError::ConnectionTimeout {
                addr: self.config.address(),
                after: self.config.connect_timeout,
            })
        }
    }

    /// Captured editor output
    pub fn output(&self, clear: bool) -> Vec<String> {
        self.connection.events().buffered_output(clear)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.connection.events().subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Stop accepting and drop the active plugin
    pub async fn stop(&self) {
        let listener = self.listener().take();
        if let Some(listener) = listener {
            listener.task.abort();
            // Nothing new is spawned once the accept loop is gone
            let _ = listener.task.await;
            let mut peers = std::mem::take(&mut *lock_peers(&listener.peers));
            peers.abort_all();
            while peers.join_next().await.is_some() {}
            // Release a claim left by a peer cut off mid-upgrade
            self.connection.abort_connecting();
            info!("Editor bridge on {} stopped", listener.addr);
        }
        self.connection.close_transport().await;
        self.connection.teardown("editor bridge stopped").await;
    }

    fn listener(&self) -> MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_peers(peers: &PeerTasks) -> MutexGuard<'_, JoinSet<()>> {
    peers.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn accept_loop(
    listener: TcpListener,
    connection: Connection,
    handshake_timeout: Duration,
    peers: PeerTasks,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let mut peers = lock_peers(&peers);
                while peers.try_join_next().is_some() {}
                peers.spawn(serve_peer(stream, addr, connection.clone(), handshake_timeout));
            }
            Err(e) => {
                warn!("Editor bridge accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_peer(
    stream: TcpStream,
    addr: SocketAddr,
    connection: Connection,
    handshake_timeout: Duration,
) {
    // Claim the channel before the upgrade so a peer still handshaking
    // counts as active
    let claimed = connection.begin_connecting();

    let socket = match tokio::time::timeout(
        handshake_timeout,
        tokio_tungstenite::accept_async(stream),
    )
    .await
    {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            warn!("WebSocket upgrade from {} failed: {}", addr, e);
            if claimed {
                connection.abort_connecting();
            }
            return;
        }
        Err(_) => {
            warn!("WebSocket upgrade from {} timed out", addr);
            if claimed {
                connection.abort_connecting();
            }
            return;
        }
    };

    if !claimed {
        warn!("Rejecting editor peer {}: another client is already connected", addr);
        reject_busy(socket).await;
        return;
    }

    let (sink, stream) = socket.split();
    connection
        .establish(
            Box::new(WsReadWrapper(stream)),
            Box::new(WsWriteWrapper(sink)),
            PeerInfo::new(addr.to_string()),
        )
        .await;
}
