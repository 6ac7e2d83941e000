//! The per-session state machine.
//!
//! ## Responsibilities
//! - Hold the fields a Session needs: identity, status, connection key,
//!   modes/models, pending permissions, the single pending-prompt slot, and
//!   the detached flag.
//! - Enforce the invariant that only one pending prompt exists at a time and
//!   that `pendingPrompt` is drained the instant `status` becomes `ready`.
//!
//! ## Design Principles
//! - Single Responsibility: a `Session` only tracks state, it never calls
//!   out to a Connection or the registry itself. The façade in
//!   [`crate::broker`] composes Session mutations with I/O.
//! - Ownership: a Session never holds its Connection directly, only the
//!   `connectionKey` that identifies it in the Pool, avoiding a reference
//!   cycle and making death observation a single lookup.

use std::collections::HashMap;

use agent_client_protocol::{SessionModeState, SessionModelState};
use tokio::sync::oneshot;

use crate::event::EventCoalescer;
use crate::tracing_utils::TraceContext;

/// `sessionKey = "{providerId}-acp-{conversationId}"`.
pub fn session_key(provider_id: &str, conversation_id: &str) -> String {
    format!("{provider_id}-acp-{conversation_id}")
}

/// `connectionKey` for a pooled provider; dedicated providers use the
/// session key itself as their connection key.
pub fn pooled_connection_key(provider_id: &str, cwd: &str) -> String {
    format!("{provider_id}::{cwd}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Initializing,
    Ready,
    Submitted,
    Streaming,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Ready => "ready",
            SessionStatus::Submitted => "submitted",
            SessionStatus::Streaming => "streaming",
            SessionStatus::Error => "error",
        }
    }
}

/// Resolution for an in-flight `requestPermission` call from the agent.
/// Exactly one of `Selected(id)` / `Cancelled` is ever sent.
pub enum PermissionOutcome {
    Selected(String),
    Cancelled,
}

pub struct PendingPermission {
    pub tool_call_id: String,
    pub options: Vec<agent_client_protocol::PermissionOption>,
    pub resolver: oneshot::Sender<PermissionOutcome>,
}

/// A queued prompt, replacing any prior one, dispatched once `status`
/// returns to `ready`.
#[derive(Debug, Clone)]
pub struct PendingPrompt {
    pub message: String,
    pub files: Vec<PromptFile>,
}

#[derive(Debug, Clone)]
pub struct PromptFile {
    pub url: String,
    pub media_type: String,
    pub filename: Option<String>,
}

pub struct Session {
    pub session_key: String,
    pub conversation_id: String,
    pub provider_id: String,
    pub cwd: String,
    pub status: SessionStatus,
    pub connection_key: String,
    pub acp_session_id: Option<String>,
    pub modes: Option<SessionModeState>,
    pub models: Option<SessionModelState>,
    pub pending_permissions: HashMap<String, PendingPermission>,
    pub pending_prompt: Option<PendingPrompt>,
    pub detached: bool,
    /// Open only while a `loadSession` call is in flight; captures
    /// `sessionUpdate`s instead of forwarding them live.
    pub history_buffer: Option<Vec<agent_client_protocol::SessionNotification>>,
    pub coalescer: EventCoalescer,
    /// Set once at `createSession`; every prompt/cancel/permission request
    /// against this session derives a child request id from it so logs can
    /// be correlated per-session and per-request (§10.1).
    pub trace: TraceContext,
}

impl Session {
    pub fn new(
        session_key: String,
        conversation_id: String,
        provider_id: String,
        cwd: String,
        connection_key: String,
        coalescer: EventCoalescer,
    ) -> Self {
        Self {
            session_key,
            conversation_id,
            provider_id,
            cwd,
            status: SessionStatus::Initializing,
            connection_key,
            acp_session_id: None,
            modes: None,
            models: None,
            pending_permissions: HashMap::new(),
            pending_prompt: None,
            detached: false,
            history_buffer: None,
            coalescer,
            trace: TraceContext::new_session(),
        }
    }

    /// (P6) `pendingPrompt` is non-null only outside `ready`.
    pub fn assert_pending_prompt_invariant(&self) {
        if self.status == SessionStatus::Ready {
            debug_assert!(
                self.pending_prompt.is_none(),
                "pendingPrompt must be drained before status settles on ready"
            );
        }
    }

    pub fn open_history_buffer(&mut self) {
        self.history_buffer = Some(Vec::new());
    }

    /// Drain the history buffer, returning whatever was captured during
    /// `loadSession`. Leaves the session with no open buffer.
    pub fn drain_history_buffer(&mut self) -> Vec<agent_client_protocol::SessionNotification> {
        self.history_buffer.take().unwrap_or_default()
    }
}
