//! Inbound Request Router: dispatches agent-initiated calls to the session
//! they belong to.
//!
//! ## Responsibilities
//! - Resolve the owning `sessionKey` for an inbound call. Multi-session
//!   connections carry an explicit `sessionId`; dedicated connections fall
//!   back to "the sole session on this connection" when the agent omits it
//!   (some agents don't echo `sessionId` on every callback).
//! - Translate `sessionUpdate`/`requestPermission`/`readTextFile`/
//!   `writeTextFile` into registry/filesystem operations, buffering session
//!   updates into the open history buffer during `loadSession` instead of
//!   forwarding them live.
//!
//! ## Design Principles
//! - Single Responsibility: routing and translation only; the actual I/O
//!   implementations live in [`crate::filesystem`], event buffering in
//!   [`crate::event`].

use std::path::Path;
use std::sync::Arc;

use agent_client_protocol::SessionNotification;

use crate::error::{BrokerError, Result};
use crate::event::Event;
use crate::filesystem;
use crate::registry::SessionRegistry;
use crate::session::SessionStatus;

pub struct Router {
    registry: Arc<SessionRegistry>,
}

impl Router {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve the session owning this connection's inbound call.
    ///
    /// `acp_session_id` is `None` when the agent's callback omits it
    /// (permitted only on dedicated, non-`multi_session` connections).
    pub fn resolve_session_key(
        &self,
        connection_key: &str,
        acp_session_id: Option<&str>,
    ) -> Result<String> {
        if let Some(id) = acp_session_id {
            if let Some(key) = self.registry.session_key_for_acp_id(id) {
                return Ok(key);
            }
            return Err(BrokerError::SessionNotFound(id.to_string()));
        }

        let mut candidates = self.registry.session_keys_for_connection(connection_key);
        match candidates.len() {
            1 => Ok(candidates.remove(0)),
            0 => Err(BrokerError::SessionNotFound(connection_key.to_string())),
            _ => Err(BrokerError::Validation(format!(
                "connection {connection_key} is multi-session; agent must supply sessionId"
            ))),
        }
    }

    /// A `session/update` notification from the agent. Buffered instead of
    /// delivered while a `loadSession` replay is in flight for this session.
    pub fn handle_session_update(
        &self,
        connection_key: &str,
        notification: SessionNotification,
    ) -> Result<()> {
        let acp_session_id = notification.session_id.0.to_string();
        let session_key = self.resolve_session_key(connection_key, Some(&acp_session_id))?;

        if self.registry.is_finalized(&session_key) {
            return Ok(());
        }

        self.registry.with_session(&session_key, |session| {
            if let Some(buffer) = session.history_buffer.as_mut() {
                buffer.push(notification);
            } else {
                if session.status == SessionStatus::Submitted {
                    session.status = SessionStatus::Streaming;
                    session.coalescer.append(Event::StatusChange("streaming"));
                }
                session
                    .coalescer
                    .append(Event::SessionUpdate(notification));
            }
        })
    }

    /// Register a pending permission and hand back its rendezvous receiver
    /// plus the request span the caller should hold for as long as it
    /// awaits the outcome, so the eventual `approvePermission`/cancellation
    /// log line nests under the same session/request correlation as the
    /// rest of this prompt turn.
    pub fn handle_request_permission(
        &self,
        connection_key: &str,
        acp_session_id: Option<&str>,
        tool_call_id: String,
        options: Vec<agent_client_protocol::PermissionOption>,
        payload: serde_json::Value,
    ) -> Result<(
        tokio::sync::oneshot::Receiver<crate::session::PermissionOutcome>,
        tracing::Span,
    )> {
        let session_key = self.resolve_session_key(connection_key, acp_session_id)?;
        let (tx, rx) = tokio::sync::oneshot::channel();

        let request_span = self.registry.with_session(&session_key, |session| {
            session.pending_permissions.insert(
                tool_call_id.clone(),
                crate::session::PendingPermission {
                    tool_call_id: tool_call_id.clone(),
                    options,
                    resolver: tx,
                },
            );
            session.coalescer.append(Event::PermissionRequest {
                payload,
                tool_call_id,
            });
            session.trace.new_request().request_span("request_permission")
        })?;

        Ok((rx, request_span))
    }

    pub async fn handle_read_text_file(
        &self,
        connection_key: &str,
        acp_session_id: Option<&str>,
        path: &Path,
    ) -> Result<String> {
        let session_key = self.resolve_session_key(connection_key, acp_session_id)?;
        let cwd = self.registry.with_session(&session_key, |s| s.cwd.clone())?;
        filesystem::read_text_file(Path::new(&cwd), path).await
    }

    pub async fn handle_write_text_file(
        &self,
        connection_key: &str,
        acp_session_id: Option<&str>,
        path: &Path,
        content: &str,
    ) -> Result<()> {
        let session_key = self.resolve_session_key(connection_key, acp_session_id)?;
        let cwd = self.registry.with_session(&session_key, |s| s.cwd.clone())?;
        filesystem::write_text_file(Path::new(&cwd), path, content).await
    }
}
