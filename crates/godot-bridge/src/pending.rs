//! Request correlation
//!
//! Every outbound request gets a fresh id and a pending entry holding the
//! caller's completion slot. The reader task settles entries by id, so
//! responses may arrive in any order.

use crate::classify::Outcome;
use crate::transport::EnvelopeSink;
use godot_bridge_core::{BridgeError, Envelope, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// In-flight state for one outbound request
struct PendingRequest {
    operation: String,
    deadline: Instant,
    completion: oneshot::Sender<Result<Value>>,
}

/// Snapshot of an in-flight request, for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    pub id: u64,
    pub operation: String,
    pub remaining_ms: u64,
}

/// Allocates request ids and matches responses to waiting callers
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.table().len()
    }

    /// Whether a request with this id is still awaiting a response
    pub fn is_pending(&self, id: u64) -> bool {
        self.table().contains_key(&id)
    }

    /// In-flight requests ordered by id
    pub fn pending_requests(&self) -> Vec<PendingSummary> {
        let now = Instant::now();
        let mut summaries: Vec<PendingSummary> = self
            .table()
            .iter()
            .map(|(id, entry)| PendingSummary {
                id: *id,
                operation: entry.operation.clone(),
                remaining_ms: entry.deadline.saturating_duration_since(now).as_millis() as u64,
            })
            .collect();
        summaries.sort_by_key(|s| s.id);
        summaries
    }

    /// Send a request through `sink` and wait for its response
    pub async fn send<S: EnvelopeSink + ?Sized>(
        &self,
        sink: &S,
        operation: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (completion, mut rx) = oneshot::channel();
        let deadline = tokio::time::Instant::now() + timeout;

        self.table().insert(
            id,
            PendingRequest {
                operation: operation.to_string(),
                deadline: deadline.into_std(),
                completion,
            },
        );
        // Removes the entry if this future is dropped before settling
        let _guard = PendingGuard { correlator: self, id };

        let envelope = Envelope::Request {
            id: Some(id.into()),
            operation: operation.to_string(),
            payload,
        };
        // The deadline covers the write too; a peer that stops reading can
        // stall it. Invalidation still reaches a caller stuck in the write.
        let write = tokio::time::timeout_at(deadline, sink.send_envelope(&envelope));
        tokio::select! {
            biased;
            written = write => match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(match e {
                        BridgeError::TransportUnavailable(_) => e,
                        other => BridgeError::TransportUnavailable(other.to_string()),
                    });
                }
                Err(_) => return self.expire(id, operation, timeout, &mut rx),
            },
            settled = &mut rx => return settled_result(settled, operation),
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(settled) => settled_result(settled, operation),
            Err(_) => self.expire(id, operation, timeout, &mut rx),
        }
    }

    fn expire(
        &self,
        id: u64,
        operation: &str,
        timeout: Duration,
        rx: &mut oneshot::Receiver<Result<Value>>,
    ) -> Result<Value> {
        if self.table().remove(&id).is_none() {
            // Settled in the same instant the timer fired
            if let Ok(result) = rx.try_recv() {
                return result;
            }
        }
        warn!("Request '{}' (id {}) timed out after {:?}", operation, id, timeout);
        Err(BridgeError::RequestTimeout {
            operation: operation.to_string(),
            id,
            after: timeout,
        })
    }

    /// Settle the pending request `id`. Returns false when nothing matched.
    pub fn resolve(&self, id: u64, outcome: Outcome) -> bool {
        let Some(entry) = self.table().remove(&id) else {
            return false;
        };

        let result = match outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(message) => Err(BridgeError::RemoteFailure {
                message: message.unwrap_or_else(|| format!("{} failed", entry.operation)),
                operation: entry.operation,
            }),
        };

        if entry.completion.send(result).is_err() {
            debug!("Caller for request {} went away before its response", id);
        }
        true
    }

    /// Fail every pending request with `TransportClosed(reason)`
    pub fn invalidate_all(&self, reason: &str) -> usize {
        let drained: Vec<(u64, PendingRequest)> = self.table().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            debug!("Invalidating request '{}' (id {})", entry.operation, id);
            let _ = entry
                .completion
                .send(Err(BridgeError::TransportClosed(reason.to_string())));
        }
        count
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

fn settled_result(
    settled: std::result::Result<Result<Value>, oneshot::error::RecvError>,
    operation: &str,
) -> Result<Value> {
    settled.unwrap_or_else(|_| {
        Err(BridgeError::TransportClosed(format!(
            "request '{}' abandoned",
            operation
        )))
    })
}

struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.table().remove(&self.id);
    }
}
