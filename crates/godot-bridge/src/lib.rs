//! Bidirectional RPC bridge to a running Godot editor
//!
//! This crate provides:
//! - `Content-Length` framing and the two channel dialects (DAP, editor plugin)
//! - Request correlation with per-request deadlines
//! - Event dispatch with a bounded output buffer
//! - Keyed FIFO lanes for mutations of one scene or resource
//! - Connection lifecycle over TCP (client) and WebSocket (server)

pub mod classify;
pub mod codec;
pub mod connection;
pub mod dap;
pub mod dialect;
pub mod editor;
pub mod endpoint;
pub mod events;
pub mod lanes;
pub mod pending;
pub mod tcp;
pub mod transport;
pub mod ws;

pub use classify::{Outcome, Route, classify};
pub use codec::{ContentLengthDecoder, encode_frame};
pub use connection::{Connection, ConnectionState, ConnectionStatus, PeerInfo};
pub use dap::DebugAdapterClient;
pub use dialect::Dialect;
pub use editor::{EditorBridge, lane_key};
pub use endpoint::RemoteEndpoint;
pub use events::{BridgeEvent, EventDispatcher, EventKind};
pub use lanes::ResourceQueue;
pub use pending::Correlator;
pub use transport::{FrameReader, FrameWriter};
