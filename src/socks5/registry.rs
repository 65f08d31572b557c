//! Session registry
//!
//! Concurrent map of connection ID → live session. The bridge
//! demultiplexer writes into proxied sessions exclusively through the
//! registry's write helpers, which enforce the proxy-mode precondition.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, warn};

use super::session::Session;
use crate::error::RegistryError;
use crate::socks5::wire::RouteMode;

/// Concurrent registry of live sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its connection ID
    pub fn add(&self, session: Arc<Session>) {
        debug!(short_id = %session.short_id(), "registry +");
        self.sessions.insert(session.conn_id().to_owned(), session);
    }

    /// Look up a session
    #[must_use]
    pub fn get(&self, conn_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(conn_id).map(|entry| Arc::clone(&entry))
    }

    /// Whether a session is registered under the ID
    #[must_use]
    pub fn exists(&self, conn_id: &str) -> bool {
        self.sessions.contains_key(conn_id)
    }

    /// Number of registered sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Deregister a session and close it
    pub async fn remove_and_close(&self, conn_id: &str) {
        if let Some((_, session)) = self.sessions.remove(conn_id) {
            session.close().await;
            debug!(short_id = %session.short_id(), "registry -");
        }
    }

    /// Drain the registry, closing every session
    pub async fn close(&self) {
        let drained: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(&entry))
            .collect();
        self.sessions.clear();
        for session in drained {
            session.close().await;
        }
        debug!("registry drained");
    }

    /// Close every proxied session
    ///
    /// Used when the bridge link drops: proxied sessions cannot survive a
    /// reconnect and are torn down rather than left orphaned. Direct
    /// sessions are untouched.
    pub async fn close_proxied(&self) {
        let proxied: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.mode() == RouteMode::Proxy)
            .map(|entry| entry.key().clone())
            .collect();
        let count = proxied.len();
        for conn_id in proxied {
            self.remove_and_close(&conn_id).await;
        }
        if count > 0 {
            warn!(count, "closed proxied sessions after bridge drop");
        }
    }

    /// Unconditional write into a proxied session
    ///
    /// Empty payloads are a logged no-op returning `Ok(0)`.
    ///
    /// # Errors
    ///
    /// Fails when the session is missing, not in proxy mode, or the
    /// underlying write fails.
    pub async fn write(&self, conn_id: &str, data: &[u8]) -> Result<usize, RegistryError> {
        self.write_with(conn_id, data, false).await
    }

    /// Write into a proxied session only once it is connected
    ///
    /// Empty payloads are a logged no-op returning `Ok(0)`.
    ///
    /// # Errors
    ///
    /// Fails when the session is missing, not in proxy mode, not yet
    /// connected, or the underlying write fails.
    pub async fn write_if_connected(
        &self,
        conn_id: &str,
        data: &[u8],
    ) -> Result<usize, RegistryError> {
        self.write_with(conn_id, data, true).await
    }

    async fn write_with(
        &self,
        conn_id: &str,
        data: &[u8],
        require_connected: bool,
    ) -> Result<usize, RegistryError> {
        let short_id = &conn_id[..conn_id.len().min(6)];
        if data.is_empty() {
            warn!(short_id, "registry write skipped, empty payload");
            return Ok(0);
        }

        let session = self
            .get(conn_id)
            .ok_or_else(|| RegistryError::not_found(conn_id))?;

        if session.mode() != RouteMode::Proxy {
            error!(short_id, "registry write refused, session not proxied");
            return Err(RegistryError::not_proxied(conn_id));
        }

        let result = if require_connected {
            session.write_if_connected(data).await
        } else {
            session.write(data).await
        };

        match result {
            Ok(n) => {
                if n == data.len() {
                    debug!(short_id, bytes = n, "registry write");
                } else {
                    warn!(short_id, expected = data.len(), wrote = n, "registry short write");
                }
                Ok(n)
            }
            Err(e) => {
                error!(short_id, error = %e, "registry write failed");
                Err(e.into())
            }
        }
    }
}
