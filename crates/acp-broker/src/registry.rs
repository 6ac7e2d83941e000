//! The Session Registry: owns every live `Session` plus the reverse index
//! from an agent's own `acpSessionId` back to our `sessionKey`.
//!
//! ## Responsibilities
//! - Atomic create-or-reuse-if-healthy so two concurrent `createSession`
//!   calls for the same `conversationId` never produce two sessions.
//! - Status transitions, with the `pendingPrompt` auto-drain on return to
//!   `ready`.
//! - Tracking which sessions share a connection, for the Router's
//!   sole-session fallback when an inbound call lacks a `sessionId`.
//!
//! ## Design Principles
//! - Dependency Inversion: generic over nothing here; the registry is pure
//!   state, concurrency-safe via `dashmap` rather than a single global
//!   mutex around the shared maps.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{BrokerError, Result};
use crate::event::EventCoalescer;
use crate::session::{Session, SessionStatus};
use crate::traits::EventSink;

/// All live sessions, keyed by `sessionKey`, plus the reverse
/// `acpSessionId -> sessionKey` index and a finalized-key set so a late
/// callback after `killSession` is a silent no-op rather than an error.
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    by_acp_session_id: DashMap<String, String>,
    finalized: DashMap<String, ()>,
    coalesce_tick: std::time::Duration,
    sink: Arc<dyn EventSink>,
}

impl SessionRegistry {
    pub fn new(coalesce_tick: std::time::Duration, sink: Arc<dyn EventSink>) -> Self {
        Self {
            sessions: DashMap::new(),
            by_acp_session_id: DashMap::new(),
            finalized: DashMap::new(),
            coalesce_tick,
            sink,
        }
    }

    /// Returns the existing session for `session_key` if one is already
    /// registered and not finalized; otherwise inserts a fresh
    /// `initializing` session and returns it. The caller distinguishes the
    /// two cases via the returned bool (`true` = freshly created).
    pub fn get_or_create(
        &self,
        session_key: &str,
        conversation_id: &str,
        provider_id: &str,
        cwd: &str,
        connection_key: &str,
    ) -> (bool, ()) {
        if self.sessions.contains_key(session_key) {
            return (false, ());
        }
        let coalescer =
            EventCoalescer::new(session_key.to_string(), self.coalesce_tick, self.sink.clone());
        let session = Session::new(
            session_key.to_string(),
            conversation_id.to_string(),
            provider_id.to_string(),
            cwd.to_string(),
            connection_key.to_string(),
            coalescer,
        );
        self.sessions.insert(session_key.to_string(), session);
        self.finalized.remove(session_key);
        (true, ())
    }

    pub fn exists(&self, session_key: &str) -> bool {
        self.sessions.contains_key(session_key)
    }

    pub fn is_finalized(&self, session_key: &str) -> bool {
        self.finalized.contains_key(session_key)
    }

    /// Run `f` against the session, returning `SessionNotFound` if it is
    /// absent. The closure never crosses an `.await` boundary inside the
    /// `dashmap` entry guard.
    pub fn with_session<T>(
        &self,
        session_key: &str,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Result<T> {
        let mut entry = self
            .sessions
            .get_mut(session_key)
            .ok_or_else(|| BrokerError::SessionNotFound(session_key.to_string()))?;
        Ok(f(&mut entry))
    }

    pub fn status(&self, session_key: &str) -> Result<SessionStatus> {
        self.with_session(session_key, |s| s.status)
    }

    /// Transition status. When the new status is `ready`, drains and
    /// returns any `pendingPrompt` that accumulated while busy — the caller
    /// is responsible for dispatching it, keeping this function free of I/O.
    pub fn set_status(
        &self,
        session_key: &str,
        status: SessionStatus,
    ) -> Result<Option<crate::session::PendingPrompt>> {
        self.with_session(session_key, |s| {
            s.status = status;
            let drained = if status == SessionStatus::Ready {
                s.pending_prompt.take()
            } else {
                None
            };
            s.assert_pending_prompt_invariant();
            drained
        })
    }

    pub fn register_acp_session_id(&self, session_key: &str, acp_session_id: &str) -> Result<()> {
        self.with_session(session_key, |s| {
            s.acp_session_id = Some(acp_session_id.to_string());
        })?;
        self.by_acp_session_id
            .insert(acp_session_id.to_string(), session_key.to_string());
        Ok(())
    }

    pub fn session_key_for_acp_id(&self, acp_session_id: &str) -> Option<String> {
        self.by_acp_session_id
            .get(acp_session_id)
            .map(|entry| entry.clone())
    }

    /// Drop a reverse-mapping entry directly, used when a resume's
    /// pre-registered id turns out to differ from the one the agent
    /// actually returned.
    pub fn unregister_acp_session_id(&self, acp_session_id: &str) {
        self.by_acp_session_id.remove(acp_session_id);
    }

    /// All session keys currently attached to `connection_key`, used for
    /// the Router's sole-session fallback on dedicated connections.
    pub fn session_keys_for_connection(&self, connection_key: &str) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|entry| entry.connection_key == connection_key)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove the session permanently. Subsequent `with_session` calls
    /// return `SessionNotFound`; late agent callbacks against its
    /// `acpSessionId` are dropped silently by the router via `is_finalized`.
    pub fn finalize(&self, session_key: &str) {
        if let Some((_, session)) = self.sessions.remove(session_key) {
            session.coalescer.cancel();
            if let Some(id) = &session.acp_session_id {
                self.by_acp_session_id.remove(id);
            }
        }
        self.finalized.insert(session_key.to_string(), ());
    }

    pub fn all_session_keys(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }
}
