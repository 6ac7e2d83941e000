//! The Session Broker façade: the single public entry point subscribers
//! call to create, drive, and tear down sessions.
//!
//! ## Responsibilities
//! - Run the `createSession` algorithm: reuse-if-healthy, stale-kill,
//!   acquire a Connection, resume-or-new-session, register routing,
//!   transition to `ready`.
//! - Own the prompt state machine: `sendPrompt` dispatches immediately when
//!   `ready`, otherwise queues a single pending prompt; completion and
//!   error both funnel back through the registry's `setStatus`.
//! - Thin passthroughs for mode/model/config/list/fork/ext operations.
//! - Lifecycle operations: detach, reattach, kill, shutdown.
//!
//! ## Design Principles
//! - Dependency Inversion: generic only over the two external collaborators
//!   ([`AgentRegistry`], [`ConversationStore`]) that belong to the embedding
//!   application; pooling, routing, and event delivery are concrete
//!   internal collaborators.
//! - Async control flow: the "fire-and-forget" prompt pattern is a spawned
//!   task whose result is funneled back through the registry; a stray
//!   completion for a session that was finalized meanwhile is silently
//!   dropped by `with_session` returning `SessionNotFound`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use agent_client_protocol::{PermissionOptionKind, SessionModeState, SessionModelState, SessionNotification};
use tracing::{info, warn, Instrument};

use crate::config::BrokerConfig;
use crate::connection::{self, Connection};
use crate::error::{BrokerError, Result};
use crate::event::Event;
use crate::pool::ConnectionPool;
use crate::registry::SessionRegistry;
use crate::router::Router;
use crate::session::{self, PendingPrompt, PermissionOutcome, PromptFile, SessionStatus};
use crate::traits::{AgentRegistry, ConversationStore, EventSink};

/// Outcome of a successful `createSession` call.
#[derive(Debug, Clone)]
pub struct CreateSessionResult {
    pub session_key: String,
    pub acp_session_id: String,
    pub modes: Option<SessionModeState>,
    pub models: Option<SessionModelState>,
    pub history_events: Vec<SessionNotification>,
    pub resumed: bool,
}

pub struct SessionBroker {
    registry: Arc<SessionRegistry>,
    pool: Arc<ConnectionPool>,
    agents: Arc<dyn AgentRegistry>,
    store: Arc<dyn ConversationStore>,
    config: BrokerConfig,
}

impl SessionBroker {
    pub fn new(
        agents: Arc<dyn AgentRegistry>,
        store: Arc<dyn ConversationStore>,
        sink: Arc<dyn EventSink>,
        config: BrokerConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new(config.coalesce_tick, sink));
        let router = Arc::new(Router::new(registry.clone()));
        let pool = Arc::new(ConnectionPool::new(registry.clone(), router, config.clone()));
        Arc::new(Self {
            registry,
            pool,
            agents,
            store,
            config,
        })
    }

    // ---- createSession -----------------------------------------------

    pub async fn create_session(
        self: &Arc<Self>,
        conversation_id: &str,
        provider_id: &str,
        cwd: &str,
        env: HashMap<String, String>,
        resume_acp_session_id: Option<String>,
        mcp_servers: Vec<agent_client_protocol::McpServer>,
    ) -> Result<CreateSessionResult> {
        let session_key = session::session_key(provider_id, conversation_id);

        if self.registry.exists(&session_key) {
            let status = self.registry.status(&session_key)?;
            if status != SessionStatus::Error {
                let (acp_session_id, modes, models) = self.registry.with_session(&session_key, |s| {
                    (s.acp_session_id.clone(), s.modes.clone(), s.models.clone())
                })?;
                let acp_session_id = acp_session_id.ok_or_else(|| BrokerError::WrongState {
                    session_key: session_key.clone(),
                    expected: vec!["ready", "submitted", "streaming", "error"],
                    actual: "initializing",
                })?;
                return Ok(CreateSessionResult {
                    session_key,
                    acp_session_id,
                    modes,
                    models,
                    history_events: Vec::new(),
                    resumed: false,
                });
            }
            // Stale: errored session under this key. Kill it and fall through
            // to a fresh create, per the registry's stale-key handling.
            self.kill_session_internal(&session_key);
        }

        let spec = self
            .agents
            .lookup(provider_id)
            .await
            .ok_or_else(|| BrokerError::NoAcpSupport(provider_id.to_string()))?;

        let connection_key = if spec.multi_session {
            session::pooled_connection_key(provider_id, cwd)
        } else {
            session_key.clone()
        };

        let (connection, stored_id) = tokio::join!(
            self.pool.acquire(&connection_key, Path::new(cwd), spec, env),
            self.resolve_resume_id(conversation_id, resume_acp_session_id)
        );
        let connection = connection?;

        self.registry.get_or_create(
            &session_key,
            conversation_id,
            provider_id,
            cwd,
            &connection_key,
        );

        let session_span = self
            .registry
            .with_session(&session_key, |s| s.trace.session_span())?;

        let outcome = self
            .establish_acp_session(&session_key, &connection, cwd, mcp_servers, stored_id.clone())
            .instrument(session_span.clone())
            .await;

        let (final_id, modes, models, resumed, history_events, replay_dispatched) = match outcome {
            Ok(v) => v,
            Err(e) => {
                // Roll back the partial session and release the connection
                // reference acquired for it.
                self.registry.finalize(&session_key);
                self.pool.release(&connection_key);
                return Err(e);
            }
        };

        // The reverse map and the session's own `acpSessionId` field are
        // already registered for `final_id` by `establish_acp_session` (both
        // the resume-success and the new-session-with-replay paths do this
        // before returning, and before any replay prompt is spawned) — see
        // §5's ordering requirement that routable events must be resolvable
        // before the agent call that can produce them.
        self.registry.with_session(&session_key, |s| {
            s.modes = modes.clone();
            s.models = models.clone();
        })?;
        // If a context-replay prompt was already dispatched, the session is
        // already `submitted` and will return to `ready` on its own, the
        // same as any other in-flight prompt.
        if !replay_dispatched {
            self.registry.set_status(&session_key, SessionStatus::Ready)?;
        }
        self.store.set_acp_session_id(conversation_id, &final_id).await;

        session_span.in_scope(|| {
            info!(session_key = %session_key, acp_session_id = %final_id, resumed, "session ready");
        });

        Ok(CreateSessionResult {
            session_key,
            acp_session_id: final_id,
            modes,
            models,
            history_events,
            resumed,
        })
    }

    async fn resolve_resume_id(&self, conversation_id: &str, explicit: Option<String>) -> Option<String> {
        match explicit {
            Some(id) => Some(id),
            None => self.store.get_acp_session_id(conversation_id).await,
        }
    }

    /// Runs steps 6-7 of `createSession`: resume-via-`loadSession` with
    /// fallback to `newSession` + context replay, or a plain `newSession`
    /// when no prior id is known. Returns the final agent session id,
    /// modes/models, whether a resume succeeded, and any captured history.
    async fn establish_acp_session(
        self: &Arc<Self>,
        session_key: &str,
        connection: &Connection,
        cwd: &str,
        mcp_servers: Vec<agent_client_protocol::McpServer>,
        stored_id: Option<String>,
    ) -> Result<(
        String,
        Option<SessionModeState>,
        Option<SessionModelState>,
        bool,
        Vec<SessionNotification>,
        bool,
    )> {
        let Some(stored_id) = stored_id else {
            let setup = connection
                .new_session(std::path::PathBuf::from(cwd), mcp_servers)
                .await?;
            self.registry.register_acp_session_id(session_key, &setup.acp_session_id)?;
            return Ok((setup.acp_session_id, setup.modes, setup.models, false, Vec::new(), false));
        };

        self.registry.register_acp_session_id(session_key, &stored_id)?;
        self.registry.with_session(session_key, |s| s.open_history_buffer())?;

        let mut last_err = None;
        for attempt in 0..self.config.load_session_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.load_session_retry_gap).await;
            }
            match connection
                .load_session(stored_id.clone(), std::path::PathBuf::from(cwd), mcp_servers.clone())
                .await
            {
                Ok(setup) => {
                    let history = self.registry.with_session(session_key, |s| s.drain_history_buffer())?;
                    return Ok((setup.acp_session_id, setup.modes, setup.models, true, history, false));
                }
                Err(e) => last_err = Some(e),
            }
        }

        warn!(
            session_key,
            error = ?last_err,
            "loadSession failed, falling back to newSession with context replay"
        );

        // Drop the captured buffer; it was only meant to seed a resumed
        // session's replay, and we are about to replace it with our own
        // synthetic context prompt.
        self.registry.with_session(session_key, |s| {
            s.drain_history_buffer();
        })?;

        let setup = connection
            .new_session(std::path::PathBuf::from(cwd), mcp_servers)
            .await?;

        // Register the new id (and drop the stale pre-registered one) before
        // dispatching the replay prompt: the reverse map must resolve
        // `setup.acp_session_id` to this session before any `session/update`
        // for it can arrive, and the spawned `dispatch_prompt` task below
        // reads `s.acp_session_id` off the session itself (§5).
        if stored_id != setup.acp_session_id {
            self.registry.unregister_acp_session_id(&stored_id);
        }
        self.registry.register_acp_session_id(session_key, &setup.acp_session_id)?;

        let messages = self.store.message_history(&self.conversation_id_for(session_key)?).await;
        let replay_dispatched = if !messages.is_empty() {
            let replay = format!("[CONTEXT REPLAY]\n\n{}", messages.join("\n\n"));
            let broker = self.clone();
            let key = session_key.to_string();
            // Dispatched like any other prompt so it participates in the
            // normal submitted/streaming/ready lifecycle; queued ahead of
            // whatever the subscriber sends next via the pending-prompt slot.
            self.registry.set_status(session_key, SessionStatus::Submitted)?;
            let request_span = self.registry.with_session(session_key, |s| {
                s.coalescer.append(Event::StatusChange("submitted"));
                s.trace.new_request().request_span("prompt")
            })?;
            tokio::spawn(async move {
                broker.dispatch_prompt(key, replay, Vec::new()).instrument(request_span).await;
            });
            true
        } else {
            false
        };

        Ok((
            setup.acp_session_id,
            setup.modes,
            setup.models,
            false,
            Vec::new(),
            replay_dispatched,
        ))
    }

    fn conversation_id_for(&self, session_key: &str) -> Result<String> {
        self.registry.with_session(session_key, |s| s.conversation_id.clone())
    }

    // ---- sendPrompt -----------------------------------------------------

    pub fn send_prompt(self: &Arc<Self>, session_key: &str, message: String, files: Vec<PromptFile>) -> Result<()> {
        let status = self.registry.status(session_key)?;
        if status == SessionStatus::Ready {
            self.registry.set_status(session_key, SessionStatus::Submitted)?;
            let request_span = self.registry.with_session(session_key, |s| {
                s.coalescer.append(Event::StatusChange("submitted"));
                s.trace.new_request().request_span("prompt")
            })?;
            let broker = self.clone();
            let key = session_key.to_string();
            tokio::spawn(async move {
                broker.dispatch_prompt(key, message, files).instrument(request_span).await;
            });
        } else {
            self.registry.with_session(session_key, |s| {
                s.pending_prompt = Some(PendingPrompt { message, files });
            })?;
        }
        Ok(())
    }

    async fn dispatch_prompt(self: Arc<Self>, session_key: String, message: String, files: Vec<PromptFile>) {
        let Ok((connection_key, acp_session_id)) = self
            .registry
            .with_session(&session_key, |s| (s.connection_key.clone(), s.acp_session_id.clone()))
        else {
            return;
        };
        let Some(acp_session_id) = acp_session_id else {
            return;
        };
        let Some(conn) = self.pool.peek(&connection_key) else {
            // Connection death fan-out already transitioned this session to
            // `error`; nothing further to do here.
            return;
        };

        let blocks = match connection::build_prompt_blocks(&message, &files) {
            Ok(b) => b,
            Err(e) => {
                self.finish_prompt_error(&session_key, e.to_string());
                return;
            }
        };

        match conn.prompt(acp_session_id, blocks).await {
            Ok(stop_reason) => self.finish_prompt_complete(&session_key, stop_reason),
            Err(e) => self.finish_prompt_error(&session_key, e.to_string()),
        }
    }

    fn finish_prompt_complete(self: &Arc<Self>, session_key: &str, stop_reason: String) {
        let should_transition = self
            .registry
            .with_session(session_key, |s| {
                let in_flight = matches!(s.status, SessionStatus::Submitted | SessionStatus::Streaming);
                if in_flight {
                    s.coalescer.append(Event::PromptComplete(stop_reason.clone()));
                }
                in_flight
            })
            .unwrap_or(false);
        if should_transition {
            self.transition_ready(session_key);
        }
    }

    fn finish_prompt_error(self: &Arc<Self>, session_key: &str, message: String) {
        let _ = self
            .registry
            .with_session(session_key, |s| s.coalescer.append(Event::PromptError(message)));
        self.transition_ready(session_key);
    }

    /// Transitions a session back to `ready`, flushing the status-change
    /// event, then re-dispatches any queued prompt on the next tick so the
    /// `ready` event is observed first.
    fn transition_ready(self: &Arc<Self>, session_key: &str) {
        let Ok(drained) = self.registry.set_status(session_key, SessionStatus::Ready) else {
            return;
        };
        let _ = self
            .registry
            .with_session(session_key, |s| s.coalescer.append(Event::StatusChange("ready")));
        if let Some(pending) = drained {
            let broker = self.clone();
            let key = session_key.to_string();
            let request_span = self
                .registry
                .with_session(session_key, |s| s.trace.new_request().request_span("prompt"))
                .unwrap_or_else(|_| tracing::Span::none());
            tokio::spawn(async move {
                broker
                    .dispatch_prompt(key, pending.message, pending.files)
                    .instrument(request_span)
                    .await;
            });
        }
    }

    // ---- cancelSession ----------------------------------------------------

    pub async fn cancel_session(self: &Arc<Self>, session_key: &str) -> Result<()> {
        let (connection_key, acp_session_id, status_before, request_span) =
            self.registry.with_session(session_key, |s| {
                (
                    s.connection_key.clone(),
                    s.acp_session_id.clone(),
                    s.status,
                    s.trace.new_request().request_span("cancel"),
                )
            })?;
        let acp_session_id = acp_session_id.ok_or_else(|| BrokerError::WrongState {
            session_key: session_key.to_string(),
            expected: vec!["ready", "submitted", "streaming"],
            actual: "initializing",
        })?;

        let result = match self.pool.peek(&connection_key) {
            Some(conn) => conn.cancel(acp_session_id).instrument(request_span).await,
            None => Err(BrokerError::ConnectionDead(connection_key)),
        };

        if result.is_ok() || matches!(status_before, SessionStatus::Submitted | SessionStatus::Streaming) {
            self.transition_ready(session_key);
        }
        result
    }

    // ---- approvePermission -------------------------------------------

    pub fn approve_permission(&self, session_key: &str, tool_call_id: &str, approved: bool) -> Result<()> {
        self.registry.with_session(session_key, |session| {
            let Some(pending) = session.pending_permissions.remove(tool_call_id) else {
                return;
            };
            let outcome = if approved {
                let option_id = pending
                    .options
                    .iter()
                    .find(|o| {
                        matches!(
                            o.kind,
                            PermissionOptionKind::AllowOnce | PermissionOptionKind::AllowAlways
                        )
                    })
                    .or_else(|| pending.options.first())
                    .map(|o| o.id.0.to_string())
                    .unwrap_or_else(|| "allow".to_string());
                PermissionOutcome::Selected(option_id)
            } else {
                PermissionOutcome::Cancelled
            };
            let _ = pending.resolver.send(outcome);
        })
    }

    // ---- setMode / setConfigOption / setModel / listSessions / forkSession / extMethod

    pub async fn set_mode(&self, session_key: &str, mode_id: String) -> Result<()> {
        let (conn, acp_session_id) = self.live_connection_for_session(session_key).await?;
        conn.set_session_mode(acp_session_id, mode_id).await
    }

    pub async fn set_config_option(&self, session_key: &str, config_id: String, value: serde_json::Value) -> Result<()> {
        let (conn, acp_session_id) = self.live_connection_for_session(session_key).await?;
        conn.set_session_config_option(acp_session_id, config_id, value).await
    }

    pub async fn set_model(&self, session_key: &str, model_id: String) -> Result<()> {
        let (conn, acp_session_id) = self.live_connection_for_session(session_key).await?;
        conn.unstable_set_session_model(acp_session_id, model_id).await
    }

    /// Loops on `nextCursor` until exhausted, returning the concatenated
    /// `sessions` array under the same key.
    pub async fn list_sessions(&self, session_key: &str, cwd: Option<String>) -> Result<serde_json::Value> {
        let connection_key = self.registry.with_session(session_key, |s| s.connection_key.clone())?;
        let conn = self.pool.peek(&connection_key).ok_or(BrokerError::ConnectionDead(connection_key))?;

        let mut sessions = Vec::new();
        let mut cursor = None;
        loop {
            let page = conn.unstable_list_sessions(cwd.clone(), cursor.clone()).await?;
            if let Some(items) = page.get("sessions").and_then(|v| v.as_array()) {
                sessions.extend(items.clone());
            }
            cursor = page.get("nextCursor").and_then(|v| v.as_str()).map(|s| s.to_string());
            if cursor.is_none() {
                break;
            }
        }
        Ok(serde_json::json!({ "sessions": sessions }))
    }

    /// Returns the new agent session id. Does not persist it to the
    /// Conversation Store: forking is not the same conversation resuming,
    /// so it should not overwrite the original conversation's resumable id.
    pub async fn fork_session(&self, session_key: &str) -> Result<String> {
        let (conn, acp_session_id) = self.live_connection_for_session(session_key).await?;
        conn.unstable_fork_session(acp_session_id).await
    }

    pub async fn ext_method(&self, session_key: &str, method: String, params: serde_json::Value) -> Result<serde_json::Value> {
        let connection_key = self.registry.with_session(session_key, |s| s.connection_key.clone())?;
        let conn = self.pool.peek(&connection_key).ok_or(BrokerError::ConnectionDead(connection_key))?;
        conn.ext_method(method, params).await
    }

    async fn live_connection_for_session(&self, session_key: &str) -> Result<(Connection, String)> {
        let (connection_key, acp_session_id) = self.registry.with_session(session_key, |s| {
            (s.connection_key.clone(), s.acp_session_id.clone())
        })?;
        let acp_session_id = acp_session_id.ok_or_else(|| BrokerError::WrongState {
            session_key: session_key.to_string(),
            expected: vec!["ready", "submitted", "streaming"],
            actual: "initializing",
        })?;
        let conn = self.pool.peek(&connection_key).ok_or(BrokerError::ConnectionDead(connection_key))?;
        Ok((conn, acp_session_id))
    }

    // ---- detach / reattach / kill / shutdown ---------------------------

    pub fn detach_session(&self, session_key: &str) -> Result<()> {
        self.registry.with_session(session_key, |s| s.detached = true)
    }

    pub fn reattach_session(&self, session_key: &str) -> Result<()> {
        self.registry.with_session(session_key, |s| {
            s.detached = false;
            s.coalescer.flush_now();
        })
    }

    pub fn kill_session(&self, session_key: &str) -> Result<()> {
        if !self.registry.exists(session_key) {
            return Err(BrokerError::SessionNotFound(session_key.to_string()));
        }
        self.kill_session_internal(session_key);
        Ok(())
    }

    fn kill_session_internal(&self, session_key: &str) {
        let connection_key = self.registry.with_session(session_key, |session| {
            session.coalescer.cancel();
            for (_, pending) in session.pending_permissions.drain() {
                let _ = pending.resolver.send(PermissionOutcome::Cancelled);
            }
            session.pending_prompt = None;
            session.connection_key.clone()
        });
        self.registry.finalize(session_key);
        if let Ok(connection_key) = connection_key {
            self.pool.release(&connection_key);
        }
    }

    /// Destroys every Connection, which cascades to every Session. Safe to
    /// call more than once.
    pub fn shutdown(&self) {
        for session_key in self.registry.all_session_keys() {
            let _ = self.registry.with_session(&session_key, |session| {
                session.coalescer.cancel();
                for (_, pending) in session.pending_permissions.drain() {
                    let _ = pending.resolver.send(PermissionOutcome::Cancelled);
                }
            });
            self.registry.finalize(&session_key);
        }
        self.pool.shutdown_all();
    }
}
