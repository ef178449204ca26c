//! # godot-bridge-server
//!
//! MCP server exposing the Godot bridge.
//!
//! This crate provides:
//! - MCP JSON-RPC protocol handling
//! - Tool implementations for the debugger and the editor plugin
//! - stdio transport with concurrent request handling

pub mod mcp;
pub mod tools;
pub mod transport;

use godot_bridge::{DebugAdapterClient, EditorBridge};
use godot_bridge_core::{BridgeConfig, Result};
use std::sync::Arc;

/// Godot bridge MCP server
#[derive(Clone)]
pub struct GodotBridgeServer {
    /// Debug adapter channel
    dap: Arc<DebugAdapterClient>,
    /// Editor plugin channel
    editor: Arc<EditorBridge>,
}

impl GodotBridgeServer {
    /// Create a new server; nothing is connected or bound yet
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            dap: Arc::new(DebugAdapterClient::new(config.dap)),
            editor: Arc::new(EditorBridge::new(config.editor)),
        }
    }

    pub fn dap(&self) -> &DebugAdapterClient {
        &self.dap
    }

    pub fn editor(&self) -> &EditorBridge {
        &self.editor
    }

    /// Run the server on stdio transport
    pub async fn run_stdio(self) -> Result<()> {
        transport::stdio::run(self).await
    }

    /// Drop both channels
    pub async fn shutdown(&self) {
        if let Err(e) = self.dap.disconnect().await {
            tracing::debug!("Debug adapter disconnect failed: {}", e);
        }
        self.editor.stop().await;
    }
}
