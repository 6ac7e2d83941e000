//! Broker-wide tunables.
//!
//! A plain struct with a literal `Default` impl, constructible directly or
//! layered by the embedding application.

use std::time::Duration;

/// Tunables for the broker's pool, coalescer, and resume logic.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a Connection with `refCount = 0` is kept alive before
    /// eviction. Spec value: 60 s.
    pub idle_timeout: Duration,

    /// Delay before a session's buffered events are flushed as a batch.
    /// Spec value: 16 ms.
    pub coalesce_tick: Duration,

    /// Number of `loadSession` attempts made before falling back to
    /// `newSession` + context replay.
    pub load_session_attempts: u32,

    /// Gap between `loadSession` attempts.
    pub load_session_retry_gap: Duration,

    /// Environment variables always copied from the broker's own environment
    /// into every spawned child, regardless of provider allow-list.
    pub base_env_vars: Vec<&'static str>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            coalesce_tick: Duration::from_millis(16),
            load_session_attempts: 2,
            load_session_retry_gap: Duration::from_millis(500),
            base_env_vars: vec!["PATH", "HOME", "SHELL", "TERM"],
        }
    }
}
