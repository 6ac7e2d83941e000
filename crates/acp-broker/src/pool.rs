//! Connection Pool: owns the one live [`Connection`] per `connectionKey`,
//! deduplicates concurrent creation attempts against the same key, and
//! evicts idle dedicated connections after [`crate::config::BrokerConfig::idle_timeout`].
//!
//! ## Responsibilities
//! - `acquire`: hand back a live connection for a `connectionKey`, reusing
//!   one already in the pool, joining an in-flight creation already under
//!   way, or becoming the creator itself.
//! - `release`: drop a caller's hold on a connection; arms the idle timer
//!   once the refcount reaches zero.
//! - Watch each connection's `closed` signal and, when it fires, remove the
//!   connection from the pool and fan out `session_error` to every
//!   non-detached session still pointing at it.
//!
//! ## Design Principles
//! - Single Responsibility: lifecycle and sharing of connections only;
//!   session state lives in [`crate::registry::SessionRegistry`].
//! - No lock held across `.await`: `DashMap` entries are read, cloned or
//!   dropped before any `.await` point.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::connection::{self, Connection};
use crate::error::Result;
use crate::event::Event;
use crate::registry::SessionRegistry;
use crate::router::Router;
use crate::traits::ProviderSpec;

struct PoolEntry {
    connection: Connection,
    ref_count: AtomicI64,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
}

/// Shares live [`Connection`]s across sessions that target the same
/// provider/cwd pair. Must be held behind an `Arc` so its idle-eviction and
/// death-watch tasks can hold a [`std::sync::Weak`] back-reference.
pub struct ConnectionPool {
    entries: DashMap<String, Arc<PoolEntry>>,
    in_flight: DashMap<String, watch::Receiver<bool>>,
    registry: Arc<SessionRegistry>,
    router: Arc<Router>,
    config: BrokerConfig,
}

impl ConnectionPool {
    pub fn new(registry: Arc<SessionRegistry>, router: Arc<Router>, config: BrokerConfig) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            registry,
            router,
            config,
        }
    }

    /// Acquire a live connection for `connection_key`, creating it if
    /// necessary. `caller_env` is layered on top of the provider's own
    /// environment (see [`connection::merge_caller_env`]) only when this
    /// call ends up being the one that spawns the connection; a reused
    /// connection keeps whatever environment it was first created with.
    pub async fn acquire(
        self: &Arc<Self>,
        connection_key: &str,
        cwd: &Path,
        mut spec: ProviderSpec,
        caller_env: HashMap<String, String>,
    ) -> Result<Connection> {
        let mut caller_env = Some(caller_env);
        loop {
            if let Some(entry) = self.entries.get(connection_key) {
                if !entry.connection.is_dead() {
                    self.cancel_idle_timer(&entry);
                    entry.ref_count.fetch_add(1, Ordering::SeqCst);
                    return Ok(entry.connection.clone());
                }
                drop(entry);
                self.entries.remove(connection_key);
                continue;
            }

            if let Some(rx) = self.in_flight.get(connection_key).map(|r| r.clone()) {
                let mut rx = rx;
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
                continue;
            }

            let (done_tx, done_rx) = watch::channel(false);
            match self.in_flight.entry(connection_key.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(done_rx);
                }
            }

            connection::merge_caller_env(&mut spec, caller_env.take().unwrap_or_default());
            let result = Connection::spawn(
                spec.clone(),
                cwd.to_path_buf(),
                self.config.base_env_vars.clone(),
                self.router.clone(),
                connection_key.to_string(),
            )
            .await;

            match &result {
                Ok(conn) => {
                    let entry = Arc::new(PoolEntry {
                        connection: conn.clone(),
                        ref_count: AtomicI64::new(1),
                        idle_timer: Mutex::new(None),
                    });
                    self.entries.insert(connection_key.to_string(), entry);
                    self.spawn_death_watch(connection_key.to_string(), conn.clone());
                }
                Err(_) => {}
            }

            let _ = done_tx.send(true);
            self.in_flight.remove(connection_key);

            return result;
        }
    }

    /// Look up the live connection for a key without affecting its
    /// refcount or idle timer. Sessions hold only `connectionKey`, not an
    /// owning handle, and must re-resolve through the pool on every use to
    /// observe death.
    pub fn peek(&self, connection_key: &str) -> Option<Connection> {
        self.entries.get(connection_key).and_then(|entry| {
            if entry.connection.is_dead() {
                None
            } else {
                Some(entry.connection.clone())
            }
        })
    }

    /// Release a caller's hold. Arms the idle-eviction timer once the
    /// refcount drops to zero.
    pub fn release(self: &Arc<Self>, connection_key: &str) {
        let Some(entry) = self.entries.get(connection_key).map(|e| e.clone()) else {
            return;
        };
        let prev = entry.ref_count.fetch_sub(1, Ordering::SeqCst);
        if prev <= 1 {
            self.arm_idle_timer(connection_key.to_string(), entry);
        }
    }

    fn cancel_idle_timer(&self, entry: &PoolEntry) {
        if let Some(handle) = entry.idle_timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn arm_idle_timer(self: &Arc<Self>, connection_key: String, entry: Arc<PoolEntry>) {
        self.cancel_idle_timer(&entry);
        let pool = Arc::downgrade(self);
        let idle_timeout = self.config.idle_timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            if let Some(pool) = pool.upgrade() {
                pool.evict_if_idle(&connection_key).await;
            }
        });
        *entry.idle_timer.lock().unwrap() = Some(handle);
    }

    async fn evict_if_idle(self: &Arc<Self>, connection_key: &str) {
        let should_evict = self
            .entries
            .get(connection_key)
            .map(|entry| entry.ref_count.load(Ordering::SeqCst) <= 0)
            .unwrap_or(false);
        if !should_evict {
            return;
        }
        if let Some((_, entry)) = self.entries.remove(connection_key) {
            debug!(connection_key, "evicting idle connection");
            entry.connection.shutdown();
        }
    }

    /// Watch a freshly-created connection's `closed` signal and fan out
    /// `on_death` handling once it fires, whether from a clean agent exit,
    /// a killed process group, or an explicit [`Connection::shutdown`].
    fn spawn_death_watch(self: &Arc<Self>, connection_key: String, connection: Connection) {
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            connection.wait_closed().await;
            if let Some(pool) = pool.upgrade() {
                pool.on_death(&connection_key, "agent connection closed".to_string());
            }
        });
    }

    /// A connection has died (agent exited, was killed, or failed
    /// mid-flight). Remove it from the pool and tell every session still
    /// bound to it: non-detached sessions get a `session_error` event,
    /// detached sessions are silently finalized.
    pub fn on_death(&self, connection_key: &str, message: String) {
        if let Some((_, entry)) = self.entries.remove(connection_key) {
            if let Some(handle) = entry.idle_timer.lock().unwrap().take() {
                handle.abort();
            }
        }
        self.in_flight.remove(connection_key);

        for session_key in self.registry.session_keys_for_connection(connection_key) {
            let detached = self
                .registry
                .with_session(&session_key, |s| s.detached)
                .unwrap_or(false);

            if detached {
                self.registry.finalize(&session_key);
                continue;
            }

            let _ = self
                .registry
                .set_status(&session_key, crate::session::SessionStatus::Error);
            let delivered = self.registry.with_session(&session_key, |session| {
                session
                    .coalescer
                    .append(Event::SessionError(message.clone()));
            });
            if delivered.is_err() {
                warn!(session_key, "connection death fan-out found no session");
            }
        }
    }

    /// Used by shutdown: tear down every pooled connection.
    pub fn shutdown_all(&self) {
        for entry in self.entries.iter() {
            entry.connection.shutdown();
        }
        self.entries.clear();
    }
}
