//! Keyed FIFO execution lanes
//!
//! Mutating calls against the same scene or resource are chained so the
//! editor never sees two of them interleave. A lane is a chain of oneshot
//! links: each task waits for the link dropped by its predecessor, runs, and
//! drops its own link when it settles, whether it succeeded, failed or was
//! cancelled.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

struct Lane {
    /// Distinguishes a lane from a later one reusing the same key
    id: u64,
    /// Link released by the most recently scheduled task
    tail: oneshot::Receiver<()>,
    /// Tasks scheduled and not yet settled
    scheduled: usize,
}

#[derive(Default)]
struct Lanes {
    next_id: u64,
    by_key: HashMap<String, Lane>,
}

/// Serializes tasks that share a resource key
#[derive(Clone, Default)]
pub struct ResourceQueue {
    lanes: Arc<Mutex<Lanes>>,
}

impl ResourceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the next slot in `key`'s lane.
    ///
    /// The slot order is fixed here, before anything is awaited. `None`
    /// returns a ticket that runs immediately.
    pub fn ticket(&self, key: Option<&str>) -> LaneTicket {
        let Some(key) = key else {
            return LaneTicket {
                lanes: self.lanes.clone(),
                slot: None,
            };
        };

        let (release, tail) = oneshot::channel();
        let mut lanes = self.lanes();
        let slot = match lanes.by_key.get_mut(key) {
            Some(lane) => {
                lane.scheduled += 1;
                let previous = std::mem::replace(&mut lane.tail, tail);
                Slot {
                    key: key.to_string(),
                    lane_id: lane.id,
                    previous: Some(previous),
                    release: Some(release),
                }
            }
            None => {
                lanes.next_id += 1;
                let lane_id = lanes.next_id;
                lanes.by_key.insert(
                    key.to_string(),
                    Lane {
                        id: lane_id,
                        tail,
                        scheduled: 1,
                    },
                );
                Slot {
                    key: key.to_string(),
                    lane_id,
                    previous: None,
                    release: Some(release),
                }
            }
        };
        drop(lanes);

        LaneTicket {
            lanes: self.lanes.clone(),
            slot: Some(slot),
        }
    }

    /// Run `task` in `key`'s lane and return its result
    pub async fn enqueue<F, Fut, T>(&self, key: Option<&str>, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.ticket(key).run(task).await
    }

    /// Number of lanes with scheduled work
    pub fn lane_count(&self) -> usize {
        self.lanes().by_key.len()
    }

    /// Tasks scheduled and not yet settled in `key`'s lane
    pub fn scheduled(&self, key: &str) -> usize {
        self.lanes().by_key.get(key).map_or(0, |lane| lane.scheduled)
    }

    /// Drop every lane. Tasks already scheduled still run in order; new
    /// tickets start fresh lanes.
    pub fn clear(&self) {
        let mut lanes = self.lanes();
        if !lanes.by_key.is_empty() {
            debug!("Clearing {} resource lanes", lanes.by_key.len());
        }
        lanes.by_key.clear();
    }
}

struct Slot {
    key: String,
    lane_id: u64,
    previous: Option<oneshot::Receiver<()>>,
    release: Option<oneshot::Sender<()>>,
}

/// A reserved position in a lane
pub struct LaneTicket {
    lanes: Arc<Mutex<Lanes>>,
    slot: Option<Slot>,
}

impl LaneTicket {
    /// Wait for the predecessor to settle, then run `task`
    pub async fn run<F, Fut, T>(mut self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(previous) = self.slot.as_mut().and_then(|slot| slot.previous.take()) {
            // Err just means the predecessor was dropped; it still settled
            let _ = previous.await;
        }
        task().await
        // `self` drops here, releasing the next task
    }
}

impl Drop for LaneTicket {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        let drained = match lanes.by_key.get_mut(&slot.key) {
            Some(lane) if lane.id == slot.lane_id => {
                lane.scheduled -= 1;
                lane.scheduled == 0
            }
            _ => false,
        };
        if drained {
            lanes.by_key.remove(&slot.key);
        }
        drop(lanes);
        drop(slot.release);
    }
}
