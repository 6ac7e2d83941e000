//! The outbound half of an ACP Connection: one spawned child process plus
//! one JSON-RPC peer, exposing the agent-facing operations the rest of the
//! broker calls.
//!
//! ## Responsibilities
//! - Spawn the child via [`crate::transport::build_command`], perform the
//!   handshake, and expose `initialize`/`newSession`/`loadSession`/`prompt`/
//!   `cancel`/mode/model/ext-method operations plus a `closed` signal.
//! - Race every setup call against an early child exit, so a missing binary
//!   or a crash-on-launch surfaces as `acp_unavailable` within the same await
//!   rather than hanging.
//! - Service agent-initiated callbacks (`sessionUpdate`, `requestPermission`,
//!   `readTextFile`, `writeTextFile`) by driving [`crate::client_handler::ClientHandler`].
//!
//! ## Design Principles
//! - `agent_client_protocol::ClientSideConnection` is `!Send`: its futures
//!   are driven on a `tokio::task::LocalSet`. Since the rest of the broker
//!   runs on a multi-threaded runtime and shares Connections across tasks
//!   (Send + Sync), the LocalSet and the connection it drives are confined
//!   to a single dedicated OS thread running its own current-thread runtime;
//!   callers talk to it over an mpsc command channel, turning a
//!   single-threaded, directly-held `LocalSet` into a `Send`-shareable
//!   handle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agent_client_protocol::{
    Agent, CancelNotification, ClientCapabilities, ClientSideConnection, ContentBlock,
    ExtRequest, FileSystemCapability, Implementation, InitializeRequest, LoadSessionRequest,
    McpServer, ModelId, NewSessionRequest, ProtocolVersion, PromptRequest, SessionId,
    SessionModeId, SessionModeState, SessionModelState, SetSessionModeRequest,
    SetSessionModelRequest,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use crate::client_handler::ClientHandler;
use crate::error::{BrokerError, Result};
use crate::router::Router;
use crate::traits::ProviderSpec;
use crate::transport;

/// Outcome of `newSession`/`loadSession`: the agent's session id plus
/// whatever mode/model state it advertised.
#[derive(Debug, Clone, Default)]
pub struct SessionSetup {
    pub acp_session_id: String,
    pub modes: Option<SessionModeState>,
    pub models: Option<SessionModelState>,
}

/// Agent capabilities surfaced by `initialize`, trimmed to what the broker
/// actually consults.
#[derive(Debug, Clone, Default)]
pub struct AgentHandshake {
    pub load_session_supported: bool,
}

enum Cmd {
    Initialize {
        resp: oneshot::Sender<Result<AgentHandshake>>,
    },
    NewSession {
        cwd: PathBuf,
        mcp_servers: Vec<McpServer>,
        resp: oneshot::Sender<Result<SessionSetup>>,
    },
    LoadSession {
        acp_session_id: String,
        cwd: PathBuf,
        mcp_servers: Vec<McpServer>,
        resp: oneshot::Sender<Result<SessionSetup>>,
    },
    Prompt {
        acp_session_id: String,
        blocks: Vec<ContentBlock>,
        resp: oneshot::Sender<Result<String>>,
    },
    Cancel {
        acp_session_id: String,
        resp: oneshot::Sender<Result<()>>,
    },
    SetSessionMode {
        acp_session_id: String,
        mode_id: String,
        resp: oneshot::Sender<Result<()>>,
    },
    SetSessionModel {
        acp_session_id: String,
        model_id: String,
        resp: oneshot::Sender<Result<()>>,
    },
    ExtMethod {
        method: String,
        params: serde_json::Value,
        resp: oneshot::Sender<Result<serde_json::Value>>,
    },
    Shutdown,
}

/// Handle to a running ACP connection. Cheap to clone; every clone shares
/// the same background thread and child process.
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    dead: Arc<AtomicBool>,
    closed_rx: watch::Receiver<bool>,
}

impl Connection {
    /// Spawn the child and drive its handshake. Returns once `initialize`
    /// has completed or the child has exited/timed out trying.
    pub async fn spawn(
        spec: ProviderSpec,
        cwd: PathBuf,
        base_env_vars: Vec<&'static str>,
        router: Arc<Router>,
        connection_key: String,
    ) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let dead = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let dead_for_thread = dead.clone();
        let thread_key = connection_key.clone();
        std::thread::Builder::new()
            .name(format!("acp-conn-{connection_key}"))
            .spawn(move || {
                run_connection_thread(
                    spec,
                    cwd,
                    base_env_vars,
                    router,
                    thread_key,
                    cmd_rx,
                    ready_tx,
                    dead_for_thread,
                    closed_tx,
                );
            })
            .map_err(|e| BrokerError::AcpUnavailable(format!("failed to spawn connection thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self { cmd_tx, dead, closed_rx }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BrokerError::AcpUnavailable(
                "connection thread exited before completing handshake".to_string(),
            )),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// A `watch` receiver that flips to `true` exactly once, when the
    /// connection's background thread has torn down the child process.
    /// Cloning preserves the current value, so a subscriber that arrives
    /// after the flip still observes it immediately instead of blocking
    /// forever on a missed notification.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Wait until the connection has closed. Returns immediately if it
    /// already has.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Cmd) -> Result<T> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionDead(
                "connection already marked dead".to_string(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| BrokerError::ConnectionDead("connection actor stopped".to_string()))?;
        rx.await
            .map_err(|_| BrokerError::ConnectionDead("connection actor dropped response".to_string()))?
    }

    pub async fn initialize(&self) -> Result<AgentHandshake> {
        self.call(|resp| Cmd::Initialize { resp }).await
    }

    pub async fn new_session(
        &self,
        cwd: PathBuf,
        mcp_servers: Vec<McpServer>,
    ) -> Result<SessionSetup> {
        self.call(|resp| Cmd::NewSession {
            cwd,
            mcp_servers,
            resp,
        })
        .await
    }

    pub async fn load_session(
        &self,
        acp_session_id: String,
        cwd: PathBuf,
        mcp_servers: Vec<McpServer>,
    ) -> Result<SessionSetup> {
        self.call(|resp| Cmd::LoadSession {
            acp_session_id,
            cwd,
            mcp_servers,
            resp,
        })
        .await
    }

    pub async fn prompt(&self, acp_session_id: String, blocks: Vec<ContentBlock>) -> Result<String> {
        self.call(|resp| Cmd::Prompt {
            acp_session_id,
            blocks,
            resp,
        })
        .await
    }

    pub async fn cancel(&self, acp_session_id: String) -> Result<()> {
        self.call(|resp| Cmd::Cancel {
            acp_session_id,
            resp,
        })
        .await
    }

    pub async fn set_session_mode(&self, acp_session_id: String, mode_id: String) -> Result<()> {
        self.call(|resp| Cmd::SetSessionMode {
            acp_session_id,
            mode_id,
            resp,
        })
        .await
    }

    /// `unstable_setSessionModel`: routed through the crate's `unstable`
    /// feature-gated `set_session_model` method rather than `extMethod`,
    /// since this version of `agent-client-protocol` already has a typed
    /// (if unstable) RPC for it.
    pub async fn unstable_set_session_model(
        &self,
        acp_session_id: String,
        model_id: String,
    ) -> Result<()> {
        self.call(|resp| Cmd::SetSessionModel {
            acp_session_id,
            model_id,
            resp,
        })
        .await
    }

    /// `setSessionConfigOption`: no dedicated RPC exists in this protocol
    /// version, so it is a tagged `extMethod` passthrough rather than
    /// reflective feature detection.
    pub async fn set_session_config_option(
        &self,
        acp_session_id: String,
        config_id: String,
        value: serde_json::Value,
    ) -> Result<()> {
        let params = serde_json::json!({
            "sessionId": acp_session_id,
            "configId": config_id,
            "value": value,
        });
        self.ext_method("session/set_config_option".to_string(), params)
            .await
            .map(|_| ())
    }

    /// `unstable_listSessions`: no dedicated RPC in this protocol version;
    /// routed as a tagged `extMethod`.
    pub async fn unstable_list_sessions(
        &self,
        cwd: Option<String>,
        cursor: Option<String>,
    ) -> Result<serde_json::Value> {
        let params = serde_json::json!({ "cwd": cwd, "cursor": cursor });
        self.ext_method("session/list".to_string(), params).await
    }

    /// `unstable_forkSession`: no dedicated RPC in this protocol version;
    /// routed as a tagged `extMethod`.
    pub async fn unstable_fork_session(&self, acp_session_id: String) -> Result<String> {
        let params = serde_json::json!({ "sessionId": acp_session_id });
        let value = self.ext_method("session/fork".to_string(), params).await?;
        value
            .get("newSessionId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| BrokerError::Protocol(agent_client_protocol::Error::internal_error()))
    }

    pub async fn ext_method(
        &self,
        method: String,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.call(|resp| Cmd::ExtMethod {
            method,
            params,
            resp,
        })
        .await
    }

    /// Ask the connection's background thread to tear down the child and
    /// stop. Does not wait for the thread to finish.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown);
    }
}

/// Body of the dedicated connection thread: a current-thread runtime plus a
/// `LocalSet`, the only place the `!Send` `ClientSideConnection` is touched.
fn run_connection_thread(
    spec: ProviderSpec,
    cwd: PathBuf,
    base_env_vars: Vec<&'static str>,
    router: Arc<Router>,
    connection_key: String,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    ready_tx: oneshot::Sender<Result<()>>,
    dead: Arc<AtomicBool>,
    closed_tx: watch::Sender<bool>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(BrokerError::AcpUnavailable(format!(
                "failed to build connection runtime: {e}"
            ))));
            let _ = closed_tx.send(true);
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async move {
        let mut child = match transport::build_command(&spec, &cwd, &base_env_vars).spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = ready_tx.send(Err(BrokerError::AcpUnavailable(format!(
                    "failed to spawn {}: {e}",
                    spec.command
                ))));
                let _ = closed_tx.send(true);
                return;
            }
        };

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = ready_tx.send(Err(BrokerError::AcpUnavailable(
                    "child process did not expose piped stdio".to_string(),
                )));
                let _ = child.start_kill();
                let _ = closed_tx.send(true);
                return;
            }
        };
        let mut stderr = stderr;

        let client = ClientHandler::new(router, connection_key.clone());
        let (connection, io_task) = ClientSideConnection::new(
            client,
            stdin.compat_write(),
            stdout.compat(),
            |fut| {
                tokio::task::spawn_local(fut);
            },
        );

        tokio::task::spawn_local(async move {
            if let Err(err) = io_task.await {
                warn!(error = %err, "ACP connection I/O loop terminated");
            }
        });

        tokio::task::spawn_local(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = vec![0_u8; 4096];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        debug!(target: "acp_broker::agent_stderr", "{}", String::from_utf8_lossy(&buf[..n]));
                    }
                }
            }
        });

        let handshake_request = InitializeRequest::new(ProtocolVersion::from(1))
            .client_capabilities(
                ClientCapabilities::new()
                    .fs(FileSystemCapability::new().read_text_file(true).write_text_file(true)),
            )
            .client_info(Implementation::new("acp-broker", env!("CARGO_PKG_VERSION")));

        let handshake = tokio::select! {
            response = connection.initialize(handshake_request) => {
                response
                    .map(|r| AgentHandshake { load_session_supported: r.agent_capabilities.load_session })
                    .map_err(BrokerError::from)
            }
            status = child.wait() => {
                Err(BrokerError::AcpUnavailable(format!(
                    "agent process exited during initialize: {:?}",
                    status
                )))
            }
        };

        let handshake_info = match handshake {
            Ok(info) => {
                let _ = ready_tx.send(Ok(()));
                info
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                dead.store(true, Ordering::SeqCst);
                let _ = child.start_kill();
                let _ = closed_tx.send(true);
                return;
            }
        };

        let connection = std::rc::Rc::new(connection);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Cmd::Shutdown) | None => break,
                        Some(Cmd::Initialize { resp }) => {
                            let _ = resp.send(Ok(handshake_info.clone()));
                        }
                        Some(cmd) => {
                            // Spawned rather than awaited in place: a `cancel`
                            // must reach the agent while a `prompt` on the same
                            // connection is still in flight.
                            let connection = connection.clone();
                            tokio::task::spawn_local(async move {
                                dispatch(&connection, cmd).await;
                            });
                        }
                    }
                }
                status = child.wait() => {
                    debug!(status = ?status, connection_key = %connection_key, "agent process exited");
                    break;
                }
            }
        }

        dead.store(true, Ordering::SeqCst);
        if let Some(pid) = child.id() {
            transport::kill_process_group(pid, std::time::Duration::from_secs(5)).await;
        }
        let _ = child.start_kill();
        let _ = closed_tx.send(true);
    });
}

async fn dispatch(connection: &ClientSideConnection, cmd: Cmd) {
    match cmd {
        Cmd::Shutdown => {}
        Cmd::Initialize { resp } => {
            // Intercepted in the connection loop before reaching here; the
            // handshake already ran once during `spawn`.
            let _ = resp.send(Ok(AgentHandshake::default()));
        }
        Cmd::NewSession {
            cwd,
            mcp_servers,
            resp,
        } => {
            let request = NewSessionRequest::new(cwd).mcp_servers(mcp_servers);
            let result = connection
                .new_session(request)
                .await
                .map(|r| SessionSetup {
                    acp_session_id: r.session_id.0.to_string(),
                    modes: r.modes,
                    models: r.models,
                })
                .map_err(BrokerError::from);
            let _ = resp.send(result);
        }
        Cmd::LoadSession {
            acp_session_id,
            cwd,
            mcp_servers,
            resp,
        } => {
            let request =
                LoadSessionRequest::new(SessionId::from(acp_session_id.clone()), cwd)
                    .mcp_servers(mcp_servers);
            let result = connection
                .load_session(request)
                .await
                .map(|r| SessionSetup {
                    acp_session_id: acp_session_id.clone(),
                    modes: r.modes,
                    models: r.models,
                })
                .map_err(BrokerError::from);
            let _ = resp.send(result);
        }
        Cmd::Prompt {
            acp_session_id,
            blocks,
            resp,
        } => {
            let request = PromptRequest::new(SessionId::from(acp_session_id), blocks);
            let result = connection
                .prompt(request)
                .await
                .map(|r| stop_reason_to_string(r.stop_reason))
                .map_err(BrokerError::from);
            let _ = resp.send(result);
        }
        Cmd::Cancel {
            acp_session_id,
            resp,
        } => {
            let result = connection
                .cancel(CancelNotification::new(SessionId::from(acp_session_id)))
                .await
                .map_err(BrokerError::from);
            let _ = resp.send(result);
        }
        Cmd::SetSessionMode {
            acp_session_id,
            mode_id,
            resp,
        } => {
            let request = SetSessionModeRequest::new(
                SessionId::from(acp_session_id),
                SessionModeId::new(mode_id),
            );
            let result = connection.set_session_mode(request).await.map(|_| ()).map_err(BrokerError::from);
            let _ = resp.send(result);
        }
        Cmd::SetSessionModel {
            acp_session_id,
            model_id,
            resp,
        } => {
            let request = SetSessionModelRequest::new(
                SessionId::from(acp_session_id),
                ModelId::new(model_id),
            );
            let result = connection
                .set_session_model(request)
                .await
                .map(|_| ())
                .map_err(BrokerError::from);
            let _ = resp.send(result);
        }
        Cmd::ExtMethod {
            method,
            params,
            resp,
        } => {
            let raw_params = serde_json::value::to_raw_value(&params)
                .unwrap_or_else(|_| serde_json::value::RawValue::from_string("null".to_string()).unwrap());
            let result = connection
                .ext_method(ExtRequest {
                    method: method.into(),
                    params: raw_params.into(),
                })
                .await
                .map_err(BrokerError::from)
                .and_then(|raw| serde_json::from_str(raw.get()).map_err(BrokerError::from));
            let _ = resp.send(result);
        }
    }
}

fn stop_reason_to_string(reason: agent_client_protocol::StopReason) -> String {
    use agent_client_protocol::StopReason::*;
    match reason {
        EndTurn => "end_turn".to_string(),
        MaxTokens => "max_tokens".to_string(),
        MaxTurnRequests => "max_turn_requests".to_string(),
        Refusal => "refusal".to_string(),
        Cancelled => "cancelled".to_string(),
    }
}

/// Build content blocks for a `prompt` request: data-URL files with an
/// `image/*` media type become `ContentBlock::Image`, anything else becomes
/// an inline `ContentBlock::Resource`; the text becomes a trailing text
/// block.
pub fn build_prompt_blocks(message: &str, files: &[crate::session::PromptFile]) -> Result<Vec<ContentBlock>> {
    let mut blocks = Vec::with_capacity(files.len() + 1);
    for file in files {
        let data = extract_data_url_payload(&file.url)?;
        if file.media_type.starts_with("image/") {
            blocks.push(ContentBlock::Image(agent_client_protocol::ImageContent {
                annotations: None,
                data,
                mime_type: file.media_type.clone(),
                uri: None,
                meta: None,
            }));
        } else {
            blocks.push(ContentBlock::Resource(agent_client_protocol::EmbeddedResource {
                annotations: None,
                resource: agent_client_protocol::EmbeddedResourceResource::BlobResourceContents(
                    agent_client_protocol::BlobResourceContents {
                        blob: data,
                        mime_type: Some(file.media_type.clone()),
                        uri: file.filename.clone().unwrap_or_default(),
                        meta: None,
                    },
                ),
                meta: None,
            }));
        }
    }
    if !message.is_empty() {
        blocks.push(ContentBlock::from(message.to_string()));
    }
    Ok(blocks)
}

/// Extract the base64 payload from a `data:{mediaType};base64,{data}` URL.
fn extract_data_url_payload(url: &str) -> Result<String> {
    url.split_once(";base64,")
        .map(|(_, data)| data.to_string())
        .ok_or_else(|| BrokerError::Validation(format!("file url is not a base64 data URL: {url}")))
}

/// Extra environment overlaid for a single connection acquisition, layered
/// on top of [`ProviderSpec::env`] as the final step of the child's
/// environment construction.
pub fn merge_caller_env(spec: &mut ProviderSpec, caller_env: HashMap<String, String>) {
    spec.env.extend(caller_env);
}
