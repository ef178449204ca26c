//! # godot-bridge-core
//!
//! Core types shared by the Godot bridge crates:
//! - Message envelopes and correlation identifiers
//! - The bridge error taxonomy
//! - Channel configuration with environment overrides

pub mod config;
pub mod envelope;
pub mod error;

pub use config::{BridgeConfig, DapConfig, EditorConfig};
pub use envelope::{CorrelationId, Envelope};
pub use error::{BridgeError, Result, error_codes};
