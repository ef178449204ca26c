//! Narrow surface over either channel

use crate::connection::ConnectionStatus;
use crate::dap::DebugAdapterClient;
use crate::editor::EditorBridge;
use async_trait::async_trait;
use godot_bridge_core::Result;
use serde_json::Value;

/// A remote peer that takes requests and produces output
///
/// Implemented by both channel clients so callers that only forward
/// commands need not care which channel they talk to.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Send `operation` and wait for its result
    async fn send_request(&self, operation: &str, arguments: Value) -> Result<Value>;

    /// Output lines captured from the peer, oldest first
    fn buffered_events(&self, clear: bool) -> Vec<String>;

    fn status(&self) -> ConnectionStatus;
}

#[async_trait]
impl RemoteEndpoint for DebugAdapterClient {
    async fn send_request(&self, operation: &str, arguments: Value) -> Result<Value> {
        DebugAdapterClient::send_request(self, operation, arguments).await
    }

    fn buffered_events(&self, clear: bool) -> Vec<String> {
        self.output(clear)
    }

    fn status(&self) -> ConnectionStatus {
        DebugAdapterClient::status(self)
    }
}

#[async_trait]
impl RemoteEndpoint for EditorBridge {
    async fn send_request(&self, operation: &str, arguments: Value) -> Result<Value> {
        self.invoke(operation, arguments).await
    }

    fn buffered_events(&self, clear: bool) -> Vec<String> {
        self.output(clear)
    }

    fn status(&self) -> ConnectionStatus {
        EditorBridge::status(self)
    }
}
