//! # acp-broker - Agent Session Broker
//!
//! Multiplexes interactive AI agent conversations over the Agent Client
//! Protocol: one [`broker::SessionBroker`] façade in front of a pool of
//! pooled agent subprocess connections, a registry of live sessions, and
//! the inbound routing that turns agent callbacks (`session/update`,
//! `session/request_permission`, `fs/read_text_file`, `fs/write_text_file`)
//! back into session state transitions.
//!
//! Orchestration above this layer (conversation persistence, agent
//! discovery) is consumed through the [`traits::ConversationStore`] and
//! [`traits::AgentRegistry`] interfaces; this crate owns only the wire
//! protocol, connection lifecycle, and session bookkeeping.

// Re-export the ACP wire types callers need to build requests against the
// broker (content blocks, session ids, permission options) without a direct
// dependency on `agent-client-protocol`.
pub use agent_client_protocol::{
    ContentBlock, PermissionOption, PermissionOptionKind, SessionId, StopReason,
};

pub mod broker;
pub mod client_handler;
pub mod config;
pub mod connection;
pub mod event;
pub mod filesystem;
pub mod pool;
pub mod registry;
pub mod router;
pub mod session;
pub mod traits;
pub mod transport;
pub mod tracing_utils;

#[cfg(any(test, feature = "test-utils"))]
pub use tracing_utils::test_subscriber::{create_test_subscriber, init_test_subscriber};
pub use tracing_utils::{CapturedLog, LogCapture, TraceContext};

pub use broker::{CreateSessionResult, SessionBroker};
pub use config::BrokerConfig;
pub use event::Event;
pub use registry::SessionRegistry;
pub use session::{PermissionOutcome, Session, SessionStatus};
pub use traits::{AgentRegistry, ConversationStore, EventSink, ProviderSpec};

mod error;
pub use error::{BrokerError, Result};
