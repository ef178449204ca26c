//! Unsolicited message handling
//!
//! Output is captured into a bounded buffer for polling consumers, state
//! changes update the default target thread, lifecycle events clear the
//! attached flag. Everything is also broadcast to subscribers.

use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Default number of output lines kept
pub const DEFAULT_OUTPUT_CAPACITY: usize = 1000;

/// Semantic category of an unsolicited message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Output,
    StateChanged,
    LifecycleEnded,
    Other,
}

impl EventKind {
    /// Categorize by event name, across both channels
    pub fn of(name: &str) -> Self {
        match name {
            "output" | "log" | "print" => EventKind::Output,
            "stopped" | "continued" | "thread" | "state_changed" => EventKind::StateChanged,
            "terminated" | "exited" | "stopped_playing" => EventKind::LifecycleEnded,
            _ => EventKind::Other,
        }
    }
}

/// Event forwarded to subscribers
#[derive(Debug, Clone, Serialize)]
pub struct BridgeEvent {
    /// Channel the event arrived on (`dap` or `editor`)
    pub channel: &'static str,
    pub name: String,
    pub payload: Value,
}

/// Bounded, oldest-evicted buffer of output lines
#[derive(Debug)]
pub struct EventBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_OUTPUT_CAPACITY)),
            capacity,
        }
    }

    /// Append every non-empty line of `text`
    pub fn push_text(&mut self, text: &str) {
        for line in text.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            self.lines.push_back(line.to_string());
        }
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    /// Lines in arrival order, optionally clearing the buffer
    pub fn read(&mut self, clear: bool) -> Vec<String> {
        if clear {
            self.lines.drain(..).collect()
        } else {
            self.lines.iter().cloned().collect()
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Applies semantic handling to unsolicited messages
pub struct EventDispatcher {
    channel: &'static str,
    output: Mutex<EventBuffer>,
    default_target: Mutex<Option<i64>>,
    attached: AtomicBool,
    event_tx: broadcast::Sender<BridgeEvent>,
}

impl EventDispatcher {
    pub fn new(channel: &'static str, output_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            channel,
            output: Mutex::new(EventBuffer::new(output_capacity)),
            default_target: Mutex::new(None),
            attached: AtomicBool::new(false),
            event_tx,
        }
    }

    fn output(&self) -> MutexGuard<'_, EventBuffer> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one unsolicited message. Never blocks, never fails.
    pub fn dispatch(&self, name: &str, payload: &Value) {
        match EventKind::of(name) {
            EventKind::Output => {
                if let Some(text) = output_text(payload) {
                    self.output().push_text(text);
                }
            }
            EventKind::StateChanged => {
                if let Some(target) = target_id(payload) {
                    debug!("[{}] Default target is now {}", self.channel, target);
                    *self
                        .default_target
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(target);
                }
            }
            EventKind::LifecycleEnded => {
                if self.attached.swap(false, Ordering::SeqCst) {
                    info!("[{}] Debuggee ended ({}), detached", self.channel, name);
                }
            }
            EventKind::Other => {}
        }

        // Ignore send errors (no subscribers)
        let _ = self.event_tx.send(BridgeEvent {
            channel: self.channel,
            name: name.to_string(),
            payload: payload.clone(),
        });
    }

    /// Captured output lines, optionally clearing them
    pub fn buffered_output(&self, clear: bool) -> Vec<String> {
        self.output().read(clear)
    }

    /// Thread or session id last reported by a state change
    pub fn default_target(&self) -> Option<i64> {
        *self
            .default_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
    }

    /// Forget per-connection state; captured output is kept
    pub fn reset(&self) {
        self.set_attached(false);
        *self
            .default_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.event_tx.subscribe()
    }
}

fn output_text(payload: &Value) -> Option<&str> {
    ["output", "message", "text"]
        .iter()
        .find_map(|key| payload.get(key).and_then(Value::as_str))
        .or_else(|| payload.as_str())
}

fn target_id(payload: &Value) -> Option<i64> {
    ["threadId", "thread_id", "sessionId", "session_id"]
        .iter()
        .find_map(|key| payload.get(key).and_then(Value::as_i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_buffer_keeps_most_recent_lines() {
        let mut buffer = EventBuffer::new(3);
        buffer.push_text("one\ntwo\n\n  \nthree\r\nfour\n");
        assert_eq!(buffer.read(false), vec!["two", "three", "four"]);
        assert_eq!(buffer.read(true).len(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_output_event_captured() {
        let dispatcher = EventDispatcher::new("dap", DEFAULT_OUTPUT_CAPACITY);
        dispatcher.dispatch("output", &json!({"category": "stdout", "output": "Hello\nWorld\n"}));
        dispatcher.dispatch("log", &json!({"message": "from editor"}));
        assert_eq!(
            dispatcher.buffered_output(false),
            vec!["Hello", "World", "from editor"]
        );
    }

    #[test]
    fn test_state_change_sets_default_target() {
        let dispatcher = EventDispatcher::new("dap", 10);
        assert_eq!(dispatcher.default_target(), None);
        dispatcher.dispatch("stopped", &json!({"reason": "breakpoint", "threadId": 4}));
        assert_eq!(dispatcher.default_target(), Some(4));
        dispatcher.dispatch("stopped", &json!({"reason": "pause"}));
        assert_eq!(dispatcher.default_target(), Some(4));
    }

    #[test]
    fn test_lifecycle_end_detaches() {
        let dispatcher = EventDispatcher::new("dap", 10);
        dispatcher.set_attached(true);
        dispatcher.dispatch("terminated", &Value::Null);
        assert!(!dispatcher.is_attached());
    }

    #[test]
    fn test_malformed_payloads_ignored() {
        let dispatcher = EventDispatcher::new("dap", 10);
        dispatcher.dispatch("output", &json!({"output": 42}));
        dispatcher.dispatch("stopped", &json!("nonsense"));
        dispatcher.dispatch("whatever", &json!([1, 2]));
        assert!(dispatcher.buffered_output(false).is_empty());
        assert_eq!(dispatcher.default_target(), None);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let dispatcher = EventDispatcher::new("editor", 10);
        let mut rx = dispatcher.subscribe();
        dispatcher.dispatch("scene_changed", &json!({"scene": "res://main.tscn"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel, "editor");
        assert_eq!(event.name, "scene_changed");
    }
}
