//! Decoded protocol messages
//!
//! Both channels normalize their wire shapes into [`Envelope`] so the
//! correlation and dispatch layers stay channel-agnostic.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value linking a response to the request that caused it.
///
/// Peers echo the id back either as a JSON number or as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Number(u64),
    Text(String),
}

impl CorrelationId {
    /// Numeric sequence this id refers to, if it has one
    pub fn sequence(&self) -> Option<u64> {
        match self {
            CorrelationId::Number(n) => Some(*n),
            CorrelationId::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<u64> for CorrelationId {
    fn from(n: u64) -> Self {
        CorrelationId::Number(n)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Number(n) => write!(f, "{}", n),
            CorrelationId::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One decoded protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Outbound request, or a reverse request initiated by the peer
    Request {
        id: Option<CorrelationId>,
        operation: String,
        payload: serde_json::Value,
    },

    /// Answer to an earlier request
    Response {
        id: CorrelationId,
        operation: Option<String>,
        success: bool,
        message: Option<String>,
        /// `None` when the peer sent no body at all
        payload: Option<serde_json::Value>,
    },

    /// Unsolicited notification
    Event {
        name: String,
        payload: serde_json::Value,
    },
}

impl Envelope {
    /// Operation or event name, for diagnostics
    pub fn name(&self) -> &str {
        match self {
            Envelope::Request { operation, .. } => operation,
            Envelope::Response { operation, .. } => operation.as_deref().unwrap_or("<response>"),
            Envelope::Event { name, .. } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_from_number_or_string() {
        let n: CorrelationId = serde_json::from_str("12").unwrap();
        let s: CorrelationId = serde_json::from_str("\"12\"").unwrap();
        assert_eq!(n.sequence(), Some(12));
        assert_eq!(s.sequence(), Some(12));

        let opaque: CorrelationId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(opaque.sequence(), None);
    }
}
