//! Wire shapes of the two channels
//!
//! Each dialect decodes untrusted JSON through an internally tagged enum, so a
//! document with an unknown `type` or a missing field fails closed and is
//! dropped instead of being guessed at.

use godot_bridge_core::{CorrelationId, Envelope};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

/// Message shape spoken on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Debug Adapter Protocol (`seq` / `request_seq`, `arguments` / `body`)
    DebugAdapter,
    /// Editor plugin protocol (`id`, `params` / `result` / `error`)
    EditorTool,
}

impl Dialect {
    /// Short channel name for logs
    pub fn label(self) -> &'static str {
        match self {
            Dialect::DebugAdapter => "dap",
            Dialect::EditorTool => "editor",
        }
    }

    /// Build the outbound request document
    pub fn encode_request(self, id: u64, operation: &str, payload: &Value) -> Value {
        match self {
            Dialect::DebugAdapter => {
                let mut doc = json!({
                    "seq": id,
                    "type": "request",
                    "command": operation,
                });
                if !payload.is_null() {
                    doc["arguments"] = payload.clone();
                }
                doc
            }
            Dialect::EditorTool => {
                let params = if payload.is_null() {
                    json!({})
                } else {
                    payload.clone()
                };
                json!({
                    "type": "request",
                    "id": id,
                    "command": operation,
                    "params": params,
                })
            }
        }
    }

    /// Decode an inbound document; `None` means it was dropped
    pub fn decode(self, doc: Value) -> Option<Envelope> {
        let decoded = match self {
            Dialect::DebugAdapter => serde_json::from_value::<DapWire>(doc).map(Envelope::from),
            Dialect::EditorTool => serde_json::from_value::<ToolWire>(doc).map(Envelope::from),
        };
        match decoded {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!("[{}] Dropping message with unexpected shape: {}", self.label(), e);
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum DapWire {
    Request {
        #[serde(default)]
        seq: Option<CorrelationId>,
        command: String,
        #[serde(default)]
        arguments: Value,
    },
    Response {
        request_seq: CorrelationId,
        success: bool,
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        body: Option<Value>,
    },
    Event {
        event: String,
        #[serde(default)]
        body: Value,
    },
}

impl From<DapWire> for Envelope {
    fn from(wire: DapWire) -> Self {
        match wire {
            DapWire::Request {
                seq,
                command,
                arguments,
            } => Envelope::Request {
                id: seq,
                operation: command,
                payload: arguments,
            },
            DapWire::Response {
                request_seq,
                success,
                command,
                message,
                body,
            } => Envelope::Response {
                id: request_seq,
                operation: command,
                success,
                message,
                payload: body,
            },
            DapWire::Event { event, body } => Envelope::Event {
                name: event,
                payload: body,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ToolWire {
    Request {
        #[serde(default)]
        id: Option<CorrelationId>,
        command: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: CorrelationId,
        success: bool,
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

impl From<ToolWire> for Envelope {
    fn from(wire: ToolWire) -> Self {
        match wire {
            ToolWire::Request {
                id,
                command,
                params,
            } => Envelope::Request {
                id,
                operation: command,
                payload: params,
            },
            ToolWire::Response {
                id,
                success,
                command,
                result,
                error,
            } => Envelope::Response {
                id,
                operation: command,
                success,
                message: error,
                payload: result,
            },
            ToolWire::Event { event, data } => Envelope::Event {
                name: event,
                payload: data,
            },
        }
    }
}
