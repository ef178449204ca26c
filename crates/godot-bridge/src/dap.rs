//! Debug adapter client
//!
//! Dials the Godot debug adapter over TCP, performs the `initialize`
//! handshake and exposes the debugger operations. Breakpoint edits for one
//! file go through that file's lane, so concurrent add/remove calls never
//! overwrite each other's result.

use crate::connection::{Connection, ConnectionOptions, ConnectionState, ConnectionStatus, PeerInfo};
use crate::dialect::Dialect;
use crate::events::BridgeEvent;
use crate::tcp::{TcpReadWrapper, TcpWriteWrapper};
use godot_bridge_core::{BridgeError, DapConfig, Result};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Thread used when the adapter has not reported one yet
pub const DEFAULT_THREAD_ID: i64 = 1;

const CLIENT_ID: &str = "godot-bridge";
const ADAPTER_ID: &str = "godot";

/// How the debuggee session was started, replayed on re-attach
#[derive(Debug, Clone)]
struct SessionStart {
    command: &'static str,
    arguments: Value,
}

/// Client for the Godot debug adapter
pub struct DebugAdapterClient {
    config: DapConfig,
    connection: Connection,
    connect_lock: tokio::sync::Mutex<()>,
    /// Generation whose `initialize` handshake succeeded, 0 for none
    initialized: AtomicU64,
    breakpoints: Mutex<HashMap<String, BTreeSet<u32>>>,
    session_start: Mutex<Option<SessionStart>>,
}

impl DebugAdapterClient {
    pub fn new(config: DapConfig) -> Self {
        let connection = Connection::new(
            Dialect::DebugAdapter,
            ConnectionOptions {
                heartbeat_interval: None,
                output_capacity: config.output_capacity,
            },
        );
        Self {
            config,
            connection,
            connect_lock: tokio::sync::Mutex::new(()),
            initialized: AtomicU64::new(0),
            breakpoints: Mutex::new(HashMap::new()),
            session_start: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DapConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Connected and past the `initialize` handshake
    pub fn is_ready(&self) -> bool {
        self.connection.is_connected()
            && self.initialized.load(Ordering::SeqCst) == self.connection.generation()
    }

    /// Connect and run the `initialize` handshake. Returns the adapter
    /// capabilities. Already connected is not an error.
    pub async fn connect(&self) -> Result<Value> {
        let addr = self.config.address();
        let dial = TcpStream::connect(addr.clone());
        self.connect_with(addr, dial).await
    }

    async fn connect_with<F>(&self, addr: String, dial: F) -> Result<Value>
    where
        F: Future<Output = io::Result<TcpStream>>,
    {
        let _guard = self.connect_lock.lock().await;
        if self.is_ready() {
            return Ok(self.capabilities());
        }
        if !self.connection.begin_connecting() {
            return Err(BridgeError::TransportUnavailable(format!(
                "debug adapter channel is {:?}",
                self.connection.state()
            )));
        }

        info!("Connecting to debug adapter at {}", addr);
        let stream = match tokio::time::timeout(self.config.connect_timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.connection.abort_connecting();
                return Err(BridgeError::ConnectFailed {
                    addr,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.connection.abort_connecting();
                return Err(BridgeError::ConnectionTimeout {
                    addr,
                    after: self.config.connect_timeout,
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let generation = self
            .connection
            .establish(
                Box::new(TcpReadWrapper::new(reader)),
                Box::new(TcpWriteWrapper(writer)),
                PeerInfo::new(addr),
            )
            .await;

        let capabilities = match self
            .connection
            .request("initialize", initialize_arguments(), self.config.request_timeout)
            .await
        {
            Ok(capabilities) => capabilities,
            Err(e) => {
                warn!("Debug adapter initialize failed: {}", e);
                self.connection.teardown("initialize failed").await;
                return Err(e);
            }
        };
        self.connection
            .update_peer(|peer| peer.details = capabilities.clone());
        self.initialized.store(generation, Ordering::SeqCst);
        Ok(capabilities)
    }

    /// Connect on demand. Waits out a handshake already in progress, so
    /// nothing is sent to the adapter before `initialize` is answered.
    pub async fn ensure_connected(&self) -> Result<()> {
        if !self.is_ready() {
            self.connect().await?;
        }
        Ok(())
    }

    /// Capabilities from the last handshake
    pub fn capabilities(&self) -> Value {
        self.connection
            .peer()
            .map(|peer| peer.details)
            .unwrap_or(Value::Null)
    }

    /// Connect if needed and return the adapter capabilities
    pub async fn initialize(&self) -> Result<Value> {
        self.ensure_connected().await?;
        Ok(self.capabilities())
    }

    pub async fn attach(&self, arguments: Value) -> Result<Value> {
        self.start_session("attach", arguments).await
    }

    pub async fn launch(&self, arguments: Value) -> Result<Value> {
        self.start_session("launch", arguments).await
    }

    async fn start_session(&self, command: &'static str, arguments: Value) -> Result<Value> {
        let response = self.call(command, arguments.clone()).await?;
        self.connection.events().set_attached(true);
        *self.session_start() = Some(SessionStart { command, arguments });
        Ok(response)
    }

    async fn reattach(&self) -> Result<()> {
        let start = self.session_start().clone().unwrap_or(SessionStart {
            command: "attach",
            arguments: json!({}),
        });
        debug!("Re-attaching with {}", start.command);
        self.start_session(start.command, start.arguments).await?;
        Ok(())
    }

    pub async fn configuration_done(&self) -> Result<Value> {
        self.call("configurationDone", Value::Null).await
    }

    /// Replace the breakpoints of `path`. Lines are sorted and deduplicated.
    pub fn set_breakpoints<'a>(
        &'a self,
        path: &str,
        lines: &[u32],
    ) -> impl Future<Output = Result<Value>> + Send + 'a {
        let ticket = self.connection.lanes().ticket(Some(path));
        let path = path.to_string();
        let lines: BTreeSet<u32> = lines.iter().copied().collect();
        async move {
            ticket
                .run(|| self.apply_breakpoints(&path, lines))
                .await
        }
    }

    pub fn add_breakpoint<'a>(
        &'a self,
        path: &str,
        line: u32,
    ) -> impl Future<Output = Result<Value>> + Send + 'a {
        self.edit_breakpoints(path, move |lines| {
            lines.insert(line);
        })
    }

    pub fn remove_breakpoint<'a>(
        &'a self,
        path: &str,
        line: u32,
    ) -> impl Future<Output = Result<Value>> + Send + 'a {
        self.edit_breakpoints(path, move |lines| {
            lines.remove(&line);
        })
    }

    /// Read-modify-write of one file's breakpoints inside its lane
    fn edit_breakpoints<'a, F>(
        &'a self,
        path: &str,
        edit: F,
    ) -> impl Future<Output = Result<Value>> + Send + 'a
    where
        F: FnOnce(&mut BTreeSet<u32>) + Send + 'a,
    {
        let ticket = self.connection.lanes().ticket(Some(path));
        let path = path.to_string();
        async move {
            ticket
                .run(move || async move {
                    let mut lines = self.breakpoint_set(&path);
                    edit(&mut lines);
                    self.apply_breakpoints(&path, lines).await
                })
                .await
        }
    }

    async fn apply_breakpoints(&self, path: &str, lines: BTreeSet<u32>) -> Result<Value> {
        let response = self
            .call("setBreakpoints", breakpoint_arguments(path, &lines))
            .await?;
        let mut table = self.breakpoint_table();
        if lines.is_empty() {
            table.remove(path);
        } else {
            table.insert(path.to_string(), lines);
        }
        Ok(response)
    }

    /// Lines the adapter last acknowledged for `path`
    pub fn breakpoints(&self, path: &str) -> Vec<u32> {
        self.breakpoint_set(path).into_iter().collect()
    }

    pub async fn continue_execution(&self) -> Result<Value> {
        self.thread_request("continue").await
    }

    pub async fn pause(&self) -> Result<Value> {
        self.thread_request("pause").await
    }

    pub async fn step_over(&self) -> Result<Value> {
        self.thread_request("next").await
    }

    pub async fn step_into(&self) -> Result<Value> {
        self.thread_request("stepIn").await
    }

    pub async fn step_out(&self) -> Result<Value> {
        self.thread_request("stepOut").await
    }

    async fn thread_request(&self, command: &str) -> Result<Value> {
        self.ensure_connected().await?;
        if !self.connection.events().is_attached() {
            self.reattach().await?;
        }
        let thread_id = self.default_thread();
        self.call(command, json!({ "threadId": thread_id })).await
    }

    fn default_thread(&self) -> i64 {
        self.connection
            .events()
            .default_target()
            .unwrap_or(DEFAULT_THREAD_ID)
    }

    pub async fn stack_trace(&self, thread_id: Option<i64>) -> Result<Value> {
        let thread_id = thread_id.unwrap_or_else(|| self.default_thread());
        self.call("stackTrace", json!({ "threadId": thread_id }))
            .await
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<Value> {
        self.call("scopes", json!({ "frameId": frame_id })).await
    }

    pub async fn variables(&self, variables_reference: i64) -> Result<Value> {
        self.call(
            "variables",
            json!({ "variablesReference": variables_reference }),
        )
        .await
    }

    pub async fn evaluate(&self, expression: &str, frame_id: Option<i64>) -> Result<Value> {
        let mut arguments = json!({ "expression": expression, "context": "repl" });
        if let Some(frame_id) = frame_id {
            arguments["frameId"] = json!(frame_id);
        }
        self.call("evaluate", arguments).await
    }

    /// Send an arbitrary debug adapter command
    pub async fn send_request(&self, command: &str, arguments: Value) -> Result<Value> {
        self.call(command, arguments).await
    }

    async fn call(&self, command: &str, arguments: Value) -> Result<Value> {
        self.ensure_connected().await?;
        self.connection
            .request(command, arguments, self.config.request_timeout)
            .await
    }

    /// Captured debuggee output
    pub fn output(&self, clear: bool) -> Vec<String> {
        self.connection.events().buffered_output(clear)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.connection.events().subscribe()
    }

    /// Say goodbye, give the adapter a moment to close, then tear down
    pub async fn disconnect(&self) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if !self.connection.is_connected() {
            return Ok(());
        }
        let grace = self.config.disconnect_grace;
        let mut state = self.connection.subscribe_state();

        if let Err(e) = self
            .connection
            .request("disconnect", json!({ "terminateDebuggee": false }), grace)
            .await
        {
            debug!("Debug adapter disconnect request failed: {}", e);
        }
        self.connection.close_transport().await;

        let timed_out = tokio::time::timeout(
            grace,
            state.wait_for(|state| *state == ConnectionState::Disconnected),
        )
        .await
        .is_err();
        if timed_out {
            debug!("Debug adapter did not close within {:?}", grace);
        }
        self.connection.teardown("disconnected by client").await;
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    fn breakpoint_table(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<u32>>> {
        self.breakpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn breakpoint_set(&self, path: &str) -> BTreeSet<u32> {
        self.breakpoint_table().get(path).cloned().unwrap_or_default()
    }

    fn session_start(&self) -> MutexGuard<'_, Option<SessionStart>> {
        self.session_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn initialize_arguments() -> Value {
    json!({
        "clientID": CLIENT_ID,
        "clientName": "Godot Bridge",
        "adapterID": ADAPTER_ID,
        "linesStartAt1": true,
        "columnsStartAt1": true,
        "pathFormat": "path",
    })
}

fn breakpoint_arguments(path: &str, lines: &BTreeSet<u32>) -> Value {
    json!({
        "source": { "path": path },
        "breakpoints": lines.iter().map(|line| json!({ "line": line })).collect::<Vec<_>>(),
        "lines": lines.iter().collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ContentLengthDecoder, encode_frame};
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn send(socket: &mut tokio::net::TcpStream, doc: Value) {
        let frame = encode_frame(&serde_json::to_vec(&doc).unwrap());
        socket.write_all(&frame).await.unwrap();
    }

    /// A debug adapter that answers every request and reports what it saw
    async fn fake_adapter() -> (DapConfig, mpsc::UnboundedReceiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut decoder = ContentLengthDecoder::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for request in decoder.feed(&buf[..n]) {
                    let command = request["command"].as_str().unwrap().to_string();
                    seen_tx.send(request.clone()).unwrap();

                    if command == "attach" {
                        send(
                            &mut socket,
                            json!({"type": "event", "event": "stopped", "body": {"threadId": 4}}),
                        )
                        .await;
                    }
                    let (success, message, body) = match command.as_str() {
                        "initialize" => (true, None, json!({"supportsConfigurationDoneRequest": true})),
                        "evaluate" => (false, Some("Invalid expression"), Value::Null),
                        _ => (true, None, json!({})),
                    };
                    let mut response = json!({
                        "type": "response",
                        "seq": 0,
                        "request_seq": request["seq"],
                        "success": success,
                        "command": command,
                        "body": body,
                    });
                    if let Some(message) = message {
                        response["message"] = json!(message);
                    }
                    send(&mut socket, response).await;
                }
            }
        });

        let config = DapConfig {
            port,
            ..Default::default()
        };
        (config, seen)
    }

    fn drain(seen: &mut mpsc::UnboundedReceiver<Value>) -> Vec<Value> {
        let mut requests = Vec::new();
        while let Ok(request) = seen.try_recv() {
            requests.push(request);
        }
        requests
    }

    fn commands(requests: &[Value]) -> Vec<&str> {
        requests
            .iter()
            .map(|r| r["command"].as_str().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_breakpoints_sorted_and_sent_once() {
        let (config, mut seen) = fake_adapter().await;
        let client = DebugAdapterClient::new(config);

        let capabilities = client.initialize().await.unwrap();
        assert_eq!(capabilities["supportsConfigurationDoneRequest"], true);
        client.attach(json!({})).await.unwrap();
        client.set_breakpoints("res://a.gd", &[7, 3]).await.unwrap();

        let requests = drain(&mut seen);
        assert_eq!(commands(&requests), vec!["initialize", "attach", "setBreakpoints"]);
        assert_eq!(requests[2]["arguments"]["source"]["path"], "res://a.gd");
        assert_eq!(requests[2]["arguments"]["lines"], json!([3, 7]));
        assert_eq!(
            requests[2]["arguments"]["breakpoints"],
            json!([{"line": 3}, {"line": 7}])
        );
        assert_eq!(client.breakpoints("res://a.gd"), vec![3, 7]);
    }

    #[tokio::test]
    async fn test_concurrent_breakpoint_edits_keep_submission_order() {
        let (config, mut seen) = fake_adapter().await;
        let client = DebugAdapterClient::new(config);
        client.set_breakpoints("res://a.gd", &[5]).await.unwrap();

        let add = client.add_breakpoint("res://a.gd", 10);
        let remove = client.remove_breakpoint("res://a.gd", 5);
        // Order was fixed when the calls were made, not when they are polled
        let (removed, added) = tokio::join!(remove, add);
        removed.unwrap();
        added.unwrap();

        let lines: Vec<Value> = drain(&mut seen)
            .into_iter()
            .filter(|r| r["command"] == "setBreakpoints")
            .map(|r| r["arguments"]["lines"].clone())
            .collect();
        assert_eq!(lines, vec![json!([5]), json!([5, 10]), json!([10])]);
        assert_eq!(client.breakpoints("res://a.gd"), vec![10]);
        assert_eq!(client.connection().lanes().lane_count(), 0);
    }

    #[tokio::test]
    async fn test_step_uses_reported_thread() {
        let (config, mut seen) = fake_adapter().await;
        let client = DebugAdapterClient::new(config);

        client.attach(json!({"address": "127.0.0.1"})).await.unwrap();
        client.step_over().await.unwrap();

        let requests = drain(&mut seen);
        let next = requests.last().unwrap();
        assert_eq!(next["command"], "next");
        assert_eq!(next["arguments"]["threadId"], 4);
    }

    #[tokio::test]
    async fn test_step_reattaches_when_detached() {
        let (config, mut seen) = fake_adapter().await;
        let client = DebugAdapterClient::new(config);

        client.connect().await.unwrap();
        // Default thread until the adapter reports one
        assert_eq!(client.default_thread(), DEFAULT_THREAD_ID);
        client.step_into().await.unwrap();

        let requests = drain(&mut seen);
        assert_eq!(commands(&requests), vec!["initialize", "attach", "stepIn"]);
        assert!(client.connection().events().is_attached());
    }

    #[tokio::test]
    async fn test_remote_failure_carries_message() {
        let (config, _seen) = fake_adapter().await;
        let client = DebugAdapterClient::new(config);

        match client.evaluate("1 +", None).await {
            Err(BridgeError::RemoteFailure { operation, message }) => {
                assert_eq!(operation, "evaluate");
                assert_eq!(message, "Invalid expression");
            }
            other => panic!("Unexpected result: {:?}", other),
        }
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = DebugAdapterClient::new(DapConfig {
            port,
            ..Default::default()
        });
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, BridgeError::ConnectFailed { .. }));
        assert_eq!(client.connection().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_deadline_returns_channel_to_idle() {
        let client = DebugAdapterClient::new(DapConfig {
            connect_timeout: Duration::from_millis(50),
            ..Default::default()
        });

        let err = client
            .connect_with(client.config().address(), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionTimeout { .. }));
        assert_eq!(client.connection().state(), ConnectionState::Disconnected);
        assert!(client.connection().begin_connecting());
    }

    #[tokio::test]
    async fn test_requests_wait_for_initialize() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // (command, whether initialize had been answered when it arrived)
        let (seen_tx, mut seen) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (mut reader, writer) = socket.into_split();
            let writer = Arc::new(tokio::sync::Mutex::new(writer));
            let answered = Arc::new(AtomicBool::new(false));
            let mut decoder = ContentLengthDecoder::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                for request in decoder.feed(&buf[..n]) {
                    let command = request["command"].as_str().unwrap().to_string();
                    seen_tx
                        .send((command.clone(), answered.load(Ordering::SeqCst)))
                        .unwrap();
                    let response = json!({
                        "type": "response",
                        "seq": 0,
                        "request_seq": request["seq"],
                        "success": true,
                        "command": command,
                        "body": {},
                    });
                    let (writer, answered) = (writer.clone(), answered.clone());
                    tokio::spawn(async move {
                        if command == "initialize" {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            answered.store(true, Ordering::SeqCst);
                        }
                        let frame = encode_frame(&serde_json::to_vec(&response).unwrap());
                        writer.lock().await.write_all(&frame).await.unwrap();
                    });
                }
            }
        });

        let client = Arc::new(DebugAdapterClient::new(DapConfig {
            port,
            ..Default::default()
        }));
        let c = client.clone();
        let connecting = tokio::spawn(async move { c.connect().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.send_request("threads", json!({})).await.unwrap();
        connecting.await.unwrap().unwrap();
        assert!(client.is_ready());

        let initialize = seen.recv().await.unwrap();
        let threads = seen.recv().await.unwrap();
        assert_eq!(initialize, ("initialize".to_string(), false));
        assert_eq!(threads, ("threads".to_string(), true));
    }

    #[tokio::test]
    async fn test_graceful_disconnect() {
        let (config, mut seen) = fake_adapter().await;
        let client = DebugAdapterClient::new(config);
        client.connect().await.unwrap();

        client.disconnect().await.unwrap();
        assert_eq!(client.connection().state(), ConnectionState::Disconnected);
        assert!(client.connection().peer().is_none());
        assert_eq!(commands(&drain(&mut seen)), vec!["initialize", "disconnect"]);

        // Nothing left to tear down
        client.disconnect().await.unwrap();
    }
}
