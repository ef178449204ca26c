//! Routing decision for decoded envelopes

use godot_bridge_core::Envelope;
use serde_json::Value;

/// How a response settles its request
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Successful response; `Value::Null` when the peer sent no body
    Success(Value),
    /// Unsuccessful response with the peer's message, if any
    Failure(Option<String>),
}

/// Where an inbound envelope goes
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Settle the pending request with this id
    Resolve { id: u64, outcome: Outcome },
    /// Hand to the event dispatcher
    Dispatch { name: String, payload: Value },
    /// Nothing can use it
    Drop { reason: String },
}

/// Decide where an envelope goes
pub fn classify(envelope: Envelope) -> Route {
    match envelope {
        Envelope::Response {
            id,
            success,
            message,
            payload,
            ..
        } => {
            let Some(id) = id.sequence() else {
                return Route::Drop {
                    reason: format!("response id {} is not one of ours", id),
                };
            };
            let outcome = if success {
                Outcome::Success(payload.unwrap_or(Value::Null))
            } else {
                Outcome::Failure(message.filter(|m| !m.trim().is_empty()))
            };
            Route::Resolve { id, outcome }
        }
        // Peer-initiated requests are surfaced like events
        Envelope::Request {
            operation, payload, ..
        } => Route::Dispatch {
            name: operation,
            payload,
        },
        Envelope::Event { name, payload } => Route::Dispatch { name, payload },
    }
}
