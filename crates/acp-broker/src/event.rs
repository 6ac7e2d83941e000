//! Per-session event buffering with bounded-delay coalescing.
//!
//! ## Responsibilities
//! - Buffer `Event`s appended by the router and the broker façade.
//! - Flush a session's buffer as a single batch on a 16 ms one-shot timer,
//!   or immediately on `reattach`.
//! - Preserve enqueue order within a session; batches across sessions have
//!   no defined relative order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_client_protocol::SessionNotification;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::traits::EventSink;

/// One outbound occurrence for a session.
#[derive(Debug, Clone)]
pub enum Event {
    SessionUpdate(SessionNotification),
    PermissionRequest {
        payload: serde_json::Value,
        tool_call_id: String,
    },
    StatusChange(&'static str),
    SessionError(String),
    PromptError(String),
    PromptComplete(String),
}

struct CoalescerState {
    buffer: Vec<Event>,
    timer_armed: bool,
}

/// Buffers events for one session and flushes them as a batch.
///
/// A `Mutex`-guarded buffer plus a single spawned flush task per arm cycle,
/// rather than a persistent ticking task per session.
pub struct EventCoalescer {
    session_key: String,
    tick: Duration,
    state: Arc<Mutex<CoalescerState>>,
    sink: Arc<dyn EventSink>,
    flush_notify: Arc<Notify>,
    timer_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventCoalescer {
    pub fn new(session_key: impl Into<String>, tick: Duration, sink: Arc<dyn EventSink>) -> Self {
        Self {
            session_key: session_key.into(),
            tick,
            state: Arc::new(Mutex::new(CoalescerState {
                buffer: Vec::new(),
                timer_armed: false,
            })),
            sink,
            flush_notify: Arc::new(Notify::new()),
            timer_task: Mutex::new(None),
        }
    }

    /// Append an event. Arms the flush timer on the first append after the
    /// buffer becomes non-empty; a detached session still buffers normally.
    pub fn append(&self, event: Event) {
        let mut should_arm = false;
        {
            let mut state = self.state.lock().unwrap();
            state.buffer.push(event);
            if !state.timer_armed {
                state.timer_armed = true;
                should_arm = true;
            }
        }
        if should_arm {
            self.arm_timer();
        }
    }

    fn arm_timer(&self) {
        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let session_key = self.session_key.clone();
        let tick = self.tick;
        let flush_notify = Arc::clone(&self.flush_notify);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = flush_notify.notified() => {}
            }
            Self::drain_and_deliver(&state, &sink, &session_key);
        });
        *self.timer_task.lock().unwrap() = Some(handle);
    }

    fn drain_and_deliver(state: &Mutex<CoalescerState>, sink: &Arc<dyn EventSink>, session_key: &str) {
        let batch = {
            let mut state = state.lock().unwrap();
            state.timer_armed = false;
            std::mem::take(&mut state.buffer)
        };
        if !batch.is_empty() {
            for event in &batch {
                if let Event::StatusChange(status) = event {
                    sink.deliver_status(session_key, status);
                }
            }
            sink.deliver(session_key, batch);
        }
    }

    /// Force an immediate flush, used by `reattach` so a subscriber catches
    /// up without waiting for the next tick.
    pub fn flush_now(&self) {
        self.flush_notify.notify_waiters();
        Self::drain_and_deliver(&self.state, &self.sink, &self.session_key);
    }

    /// Cancel any pending timer and drop the buffer, used by `kill`.
    pub fn cancel(&self) {
        if let Some(handle) = self.timer_task.lock().unwrap().take() {
            handle.abort();
        }
        let mut state = self.state.lock().unwrap();
        state.buffer.clear();
        state.timer_armed = false;
    }
}
