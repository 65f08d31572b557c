//! Per-connection session state
//!
//! A [`Session`] wraps one accepted client socket together with its
//! identity, target metadata, attribute map, and one-shot close semantics.
//! Sessions are shared as `Arc<Session>` between the acceptor, the
//! forwarders, and the bridge demultiplexer; the close flag is the single
//! gate every operation checks.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SessionError;
use crate::socks5::wire::{AddrType, RouteMode};

/// Opaque attribute value stored on a session
pub type AttrValue = Arc<dyn Any + Send + Sync>;

/// Destination metadata, set exactly once after the CONNECT parse
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub atyp: AddrType,
    pub mode: RouteMode,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            atyp: AddrType::Ipv4,
            mode: RouteMode::Direct,
        }
    }
}

/// One accepted SOCKS5 client connection
pub struct Session {
    conn_id: String,
    short_id: String,
    peer_addr: Option<SocketAddr>,
    read_half: Mutex<OwnedReadHalf>,
    write_half: Mutex<OwnedWriteHalf>,
    target: RwLock<Target>,
    connected: AtomicBool,
    attrs: RwLock<HashMap<String, AttrValue>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    // Held so the close signal outlives periods with no subscribers
    close_rx: watch::Receiver<bool>,
}

impl Session {
    /// Wrap an accepted client socket in a new session
    ///
    /// Mints a fresh UUID connection ID; its first six characters become
    /// the short ID used in logs.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        let conn_id = Uuid::new_v4().to_string();
        let short_id = conn_id[..6].to_owned();
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (close_tx, close_rx) = watch::channel(false);

        debug!(short_id = %short_id, conn_id = %conn_id, "session created");
        Self {
            conn_id,
            short_id,
            peer_addr,
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
            target: RwLock::new(Target::default()),
            connected: AtomicBool::new(false),
            attrs: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_tx,
            close_rx,
        }
    }

    /// Full connection ID (UUID text form)
    #[must_use]
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// Six-character log-correlation ID
    #[must_use]
    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    /// Client socket peer address, when known
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether the close flag has been set
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Subscribe to the one-shot close signal
    ///
    /// The signal is level-triggered: subscribing after close observes the
    /// closed state immediately.
    #[must_use]
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_rx.clone()
    }

    /// Set the destination and routing mode
    ///
    /// # Errors
    ///
    /// Fails when the session is closed, the trimmed host is empty, or the
    /// port is zero.
    pub fn set_target(
        &self,
        host: &str,
        port: u16,
        atyp: AddrType,
        mode: RouteMode,
    ) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::closed(&self.short_id));
        }

        let host = host.trim();
        if host.is_empty() {
            return Err(SessionError::EmptyHost {
                short_id: self.short_id.clone(),
            });
        }
        if port == 0 {
            return Err(SessionError::InvalidPort {
                short_id: self.short_id.clone(),
                port,
            });
        }

        *self.target.write() = Target {
            host: host.to_owned(),
            port,
            atyp,
            mode,
        };
        debug!(
            short_id = %self.short_id,
            target = %format!("{host}:{port}"),
            atyp = %atyp,
            mode = %mode,
            "session target set"
        );
        Ok(())
    }

    /// Mark the destination reachable (or not)
    ///
    /// # Errors
    ///
    /// Fails when the session is closed.
    pub fn set_connected(&self, connected: bool) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::closed(&self.short_id));
        }
        self.connected.store(connected, Ordering::Release);
        debug!(short_id = %self.short_id, connected, "session connected flag");
        Ok(())
    }

    /// Whether the session is live and the destination is reachable
    #[must_use]
    pub fn is_connected(&self) -> bool {
        if self.is_closed() || !self.connected.load(Ordering::Acquire) {
            return false;
        }
        let target = self.target.read();
        !target.host.is_empty() && target.port >= 1
    }

    /// Snapshot of the destination metadata
    #[must_use]
    pub fn target(&self) -> Target {
        self.target.read().clone()
    }

    /// Routing mode of this session
    #[must_use]
    pub fn mode(&self) -> RouteMode {
        self.target.read().mode
    }

    /// Store an attribute, returning the previous value if any
    ///
    /// # Errors
    ///
    /// Fails when the session is closed.
    pub fn set_attr(
        &self,
        key: impl Into<String>,
        value: AttrValue,
    ) -> Result<Option<AttrValue>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::closed(&self.short_id));
        }
        Ok(self.attrs.write().insert(key.into(), value))
    }

    /// Fetch an attribute
    #[must_use]
    pub fn get_attr(&self, key: &str) -> Option<AttrValue> {
        self.attrs.read().get(key).cloned()
    }

    /// Remove an attribute, returning it if present
    ///
    /// # Errors
    ///
    /// Fails when the session is closed.
    pub fn remove_attr(&self, key: &str) -> Result<Option<AttrValue>, SessionError> {
        if self.is_closed() {
            return Err(SessionError::closed(&self.short_id));
        }
        let removed = self.attrs.write().remove(key);
        if removed.is_none() {
            warn!(short_id = %self.short_id, key, "remove attr miss");
        }
        Ok(removed)
    }

    /// Write the whole buffer to the client socket
    ///
    /// # Errors
    ///
    /// Fails when the session is closed or the socket write fails.
    pub async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        if self.is_closed() {
            return Err(SessionError::closed(&self.short_id));
        }
        let mut half = self.write_half.lock().await;
        half.write_all(data).await?;
        Ok(data.len())
    }

    /// Perform a single write on the client socket
    ///
    /// May write fewer bytes than given; returns the count actually
    /// written. The forwarder pipes use this to resend only the unwritten
    /// remainder after a short write.
    ///
    /// # Errors
    ///
    /// Fails when the session is closed or the socket write fails.
    pub async fn write_some(&self, data: &[u8]) -> Result<usize, SessionError> {
        if self.is_closed() {
            return Err(SessionError::closed(&self.short_id));
        }
        let mut half = self.write_half.lock().await;
        Ok(half.write(data).await?)
    }

    /// Write only when [`Self::is_connected`] holds
    ///
    /// # Errors
    ///
    /// Fails when the session is closed, not yet connected, or the socket
    /// write fails.
    pub async fn write_if_connected(&self, data: &[u8]) -> Result<usize, SessionError> {
        if self.is_closed() {
            return Err(SessionError::closed(&self.short_id));
        }
        if !self.is_connected() {
            return Err(SessionError::not_connected(&self.short_id));
        }
        self.write(data).await
    }

    /// Read from the client socket into `buf`
    ///
    /// # Errors
    ///
    /// Fails when the session is closed or the socket read fails.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SessionError> {
        if self.is_closed() {
            return Err(SessionError::closed(&self.short_id));
        }
        let mut half = self.read_half.lock().await;
        Ok(half.read(buf).await?)
    }

    /// Send FIN on the client socket, leaving the read side open
    pub async fn shutdown_write(&self) {
        let mut half = self.write_half.lock().await;
        if let Err(e) = half.shutdown().await {
            debug!(short_id = %self.short_id, error = %e, "session write shutdown");
        }
    }

    /// Close the session
    ///
    /// Idempotent: exactly one caller wins the flag transition and performs
    /// the teardown (fires the close signal, drops attributes, half-closes
    /// the socket). The socket is fully released when the last `Arc`
    /// reference drops.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let _ = self.close_tx.send(true);
        self.attrs.write().clear();
        self.connected.store(false, Ordering::Release);

        // Don't queue behind an in-flight write; the signal above ends the
        // pipes and the socket closes with the last reference.
        if let Ok(mut half) = self.write_half.try_lock() {
            let _ = half.shutdown().await;
        }
        debug!(short_id = %self.short_id, "session closed");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conn_id", &self.conn_id)
            .field("closed", &self.is_closed())
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}
