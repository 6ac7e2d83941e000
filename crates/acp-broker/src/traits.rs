//! Interfaces the broker consumes but does not implement.
//!
//! The Conversation Store, Agent Registry, and Transport Layer are external
//! collaborators. The broker is generic over them so an embedder can back
//! them with whatever storage/transport it already has.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::event::Event;

/// A provider's launch recipe plus its pooling policy.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment overlaid on top of the broker's env allow-list.
    pub env: HashMap<String, String>,
    /// Host environment variables this provider is allowed to inherit.
    pub env_allow_list: Vec<String>,
    /// Whether this provider's agent supports multiple concurrent sessions
    /// on a single subprocess (`acpMultiSession`). Non-pooled providers get
    /// a dedicated Connection per session.
    pub multi_session: bool,
}

/// Maps a provider identifier to its launch recipe.
///
/// A registry is asked for a provider and either answers with a launch
/// recipe or reports the provider unknown (`no_acp_support`, see
/// [`crate::error::BrokerError::NoAcpSupport`]).
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn lookup(&self, provider_id: &str) -> Option<ProviderSpec>;
}

/// Read/write access to the single field the broker persists:
/// `conversationId -> acpSessionId`, plus prior message history for
/// context-replay on resume fallback.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_acp_session_id(&self, conversation_id: &str) -> Option<String>;

    async fn set_acp_session_id(&self, conversation_id: &str, acp_session_id: &str);

    /// Prior turns, oldest first, used only for the synthetic
    /// `"[CONTEXT REPLAY]"` prompt on resume fallback.
    async fn message_history(&self, conversation_id: &str) -> Vec<String>;
}

/// Delivers a session's coalesced event batches to whatever is actually
/// subscribed (a websocket, an in-process channel, ...). The broker emits;
/// the transport delivers.
pub trait EventSink: Send + Sync {
    /// A batch of events for `session_key`, in enqueue order.
    fn deliver(&self, session_key: &str, events: Vec<Event>);

    /// A single status-change event, delivered in addition to `deliver` on
    /// a dedicated `status:{sessionKey}` channel.
    fn deliver_status(&self, session_key: &str, status: &'static str);
}
