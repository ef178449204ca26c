//! Transport abstractions for the bridge channels
//!
//! Provides FrameReader/FrameWriter traits implemented by the
//! `Content-Length` TCP transport and the WebSocket transport. The connection
//! manager owns one of each per live peer.

use async_trait::async_trait;
use godot_bridge_core::{Envelope, Result};
use serde_json::Value;

/// What a single read produced
#[derive(Debug)]
pub enum Inbound {
    /// Zero or more complete JSON documents
    Documents(Vec<Value>),
    /// The peer acknowledged a heartbeat
    Liveness,
}

/// Trait for async reading from a transport
#[async_trait]
pub trait FrameReader: Send {
    /// Wait for the next batch of inbound data.
    /// An error means the transport is closed or broken.
    async fn read_batch(&mut self) -> Result<Inbound>;
}

/// Trait for async writing to a transport
#[async_trait]
pub trait FrameWriter: Send {
    /// Frame and write one JSON document
    async fn write_document(&mut self, doc: &Value) -> Result<()>;

    /// Send a liveness ping; transports without one do nothing
    async fn heartbeat(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the write side so the peer sees the disconnect
    async fn close(&mut self) -> Result<()>;
}

/// Where the correlation engine hands outbound envelopes
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn send_envelope(&self, envelope: &Envelope) -> Result<()>;
}

/// Preview of a document for debug logs
pub(crate) fn preview(doc: &Value) -> String {
    doc.to_string().chars().take(200).collect()
}
