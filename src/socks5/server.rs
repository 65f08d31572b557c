//! SOCKS5 inbound server
//!
//! Accepts client connections and drives each one through the handshake
//! state machine: greeting → method selection → CONNECT parse → route.
//! Allowlisted destinations are dialed directly; everything else is
//! registered with the session registry and multiplexed over the bridge
//! transport.
//!
//! # Protocol Flow
//!
//! 1. Client sends the method-negotiation greeting; only "no
//!    authentication" is offered back.
//! 2. Client sends a CONNECT request (IPv4, domain, or IPv6 target).
//! 3. The allowlist decides the route.
//! 4. Direct path: dial, reply success/failure, relay bidirectionally.
//! 5. Proxy path: register the session and defer the reply until the
//!    remote peer's ConnectAck arrives over the bridge.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::allowlist::HostAllowlist;
use super::direct::{is_graceful_done, DirectForwarder};
use super::proxy::ProxyForwarder;
use super::registry::SessionRegistry;
use super::session::Session;
use super::wire::{
    AddrType, RouteMode, CMD_CONNECT, CONNECT_FAILURE_REPLY, CONNECT_SUCCESS_REPLY,
    METHOD_SELECT_REPLY, SOCKS5_VERSION,
};
use crate::bridge::Transport;

/// SOCKS5 server configuration
#[derive(Clone)]
pub struct Socks5ServerConfig {
    /// Identifier carried in every bridge frame for this proxy instance
    pub client_id: String,
    /// Listen address
    pub bind_addr: IpAddr,
    /// Listen port
    pub bind_port: u16,
    /// Deadline for the whole SOCKS5 handshake
    pub handshake_timeout: Duration,
    /// Deadline for the direct-path dial
    pub connect_timeout: Duration,
    /// Remote server class selector carried in bridge frames
    pub server_type: u8,
}

impl Default for Socks5ServerConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: 1080,
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            server_type: 0,
        }
    }
}

impl std::fmt::Debug for Socks5ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socks5ServerConfig")
            .field("client_id", &self.client_id)
            .field("bind_addr", &self.bind_addr)
            .field("bind_port", &self.bind_port)
            .finish()
    }
}

/// Shared context handed to every connection task
#[derive(Clone)]
struct ConnContext {
    config: Socks5ServerConfig,
    allowlist: Arc<HostAllowlist>,
    registry: Arc<SessionRegistry>,
    transport: Option<Arc<dyn Transport>>,
}

/// SOCKS5 inbound server
pub struct Socks5Server {
    ctx: ConnContext,
    listener: TcpListener,
    shutdown_tx: watch::Sender<bool>,
}

impl Socks5Server {
    /// Bind the listening socket
    ///
    /// # Errors
    ///
    /// Returns the bind error; the caller turns this into a non-zero exit.
    pub async fn bind(
        config: Socks5ServerConfig,
        allowlist: Arc<HostAllowlist>,
        registry: Arc<SessionRegistry>,
        transport: Option<Arc<dyn Transport>>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((config.bind_addr, config.bind_port)).await?;
        info!(
            client_id = %config.client_id,
            addr = %listener.local_addr()?,
            "SOCKS5 server listening"
        );
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            ctx: ConnContext {
                config,
                allowlist,
                registry,
                transport,
            },
            listener,
            shutdown_tx,
        })
    }

    /// Address the server actually bound to
    ///
    /// # Errors
    ///
    /// Propagates the socket's `local_addr` error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and handle connections until shutdown
    pub async fn serve(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    info!("SOCKS5 server shutting down");
                    break;
                }
                result = self.listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer_addr, error = %e, "set_nodelay failed");
                        }
                        let session = Arc::new(Session::new(stream));
                        debug!(
                            short_id = %session.short_id(),
                            peer = %peer_addr,
                            "connection accepted"
                        );
                        let ctx = self.ctx.clone();
                        tokio::spawn(handle_conn(ctx, session));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
            }
        }
    }

    /// Stop the accept loop, drain every session, and close the transport
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.ctx.registry.close().await;
        if let Some(transport) = &self.ctx.transport {
            transport.close();
        }
        info!("SOCKS5 server closed");
    }
}

/// Drive one accepted connection to completion
async fn handle_conn(ctx: ConnContext, session: Arc<Session>) {
    let short_id = session.short_id().to_owned();
    debug!(short_id = %short_id, "handle conn start");

    let handshake = timeout(ctx.config.handshake_timeout, async {
        handle_greeting(&session).await?;
        handle_request(&session).await
    })
    .await;

    let result = match handshake {
        Ok(Ok((host, port, atyp))) => {
            if ctx.allowlist.contains(&host, atyp.is_domain()) {
                handle_direct(&ctx, &session, &host, port, atyp).await
            } else {
                handle_proxy(&ctx, &session, &host, port, atyp).await
            }
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err("handshake timeout".to_owned()),
    };

    if let Err(e) = result {
        error!(short_id = %short_id, error = %e, "handle conn failed");
    }

    session.close().await;
    debug!(short_id = %short_id, peer = ?session.peer_addr(), "connection closed");
}

/// Fill `buf` from the session, failing on early EOF
async fn read_exact(session: &Session, buf: &mut [u8]) -> Result<(), String> {
    let mut filled = 0;
    while filled < buf.len() {
        match session.read(&mut buf[filled..]).await {
            Ok(0) => return Err("unexpected EOF".to_owned()),
            Ok(n) => filled += n,
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(())
}

/// Method-negotiation phase: VER, NMETHODS, METHODS...
///
/// The offered method list is discarded; only no-auth is ever selected.
async fn handle_greeting(session: &Session) -> Result<(), String> {
    let short_id = session.short_id();
    let mut buf = [0u8; 2];
    read_exact(session, &mut buf)
        .await
        .map_err(|e| format!("read greeting: {e}"))?;

    let (ver, nmethods) = (buf[0], buf[1]);
    debug!(short_id = %short_id, ver, nmethods, "greeting");
    if ver != SOCKS5_VERSION {
        return Err(format!("invalid version in greeting: {ver}"));
    }

    let mut methods = vec![0u8; nmethods as usize];
    read_exact(session, &mut methods)
        .await
        .map_err(|e| format!("read methods: {e}"))?;

    session
        .write(&METHOD_SELECT_REPLY)
        .await
        .map_err(|e| format!("write method select: {e}"))?;
    Ok(())
}

/// Request phase: VER, CMD, RSV, ATYP, DST.ADDR, DST.PORT
async fn handle_request(session: &Session) -> Result<(String, u16, AddrType), String> {
    let short_id = session.short_id();
    let mut buf = [0u8; 4];
    read_exact(session, &mut buf)
        .await
        .map_err(|e| format!("read request: {e}"))?;

    let (ver, cmd, atyp_byte) = (buf[0], buf[1], buf[3]);
    debug!(short_id = %short_id, ver, cmd, atyp = atyp_byte, "request");

    if ver != SOCKS5_VERSION {
        return Err(format!("invalid version in request: {ver}"));
    }
    if cmd != CMD_CONNECT {
        return Err(format!("unsupported command: {cmd}"));
    }
    let atyp =
        AddrType::from_byte(atyp_byte).ok_or_else(|| format!("invalid atyp: {atyp_byte}"))?;

    let host = match atyp {
        AddrType::Ipv4 => {
            let mut addr = [0u8; 4];
            read_exact(session, &mut addr)
                .await
                .map_err(|e| format!("read ipv4 addr: {e}"))?;
            Ipv4Addr::from(addr).to_string()
        }
        AddrType::Domain => {
            let mut len = [0u8; 1];
            read_exact(session, &mut len)
                .await
                .map_err(|e| format!("read domain length: {e}"))?;
            if len[0] == 0 {
                return Err("empty domain name".to_owned());
            }
            let mut domain = vec![0u8; len[0] as usize];
            read_exact(session, &mut domain)
                .await
                .map_err(|e| format!("read domain: {e}"))?;
            String::from_utf8_lossy(&domain).into_owned()
        }
        AddrType::Ipv6 => {
            let mut addr = [0u8; 16];
            read_exact(session, &mut addr)
                .await
                .map_err(|e| format!("read ipv6 addr: {e}"))?;
            Ipv6Addr::from(addr).to_string()
        }
    };

    let mut port_buf = [0u8; 2];
    read_exact(session, &mut port_buf)
        .await
        .map_err(|e| format!("read port: {e}"))?;
    let port = u16::from_be_bytes(port_buf);

    debug!(short_id = %short_id, target = %format!("{host}:{port}"), "request parsed");
    Ok((host, port, atyp))
}

/// Direct path: dial the allowlisted target and relay
async fn handle_direct(
    ctx: &ConnContext,
    session: &Arc<Session>,
    host: &str,
    port: u16,
    atyp: AddrType,
) -> Result<(), String> {
    let short_id = session.short_id().to_owned();
    debug!(short_id = %short_id, target = %format!("{host}:{port}"), "direct start");

    session
        .set_target(host, port, atyp, RouteMode::Direct)
        .map_err(|e| format!("set target: {e}"))?;

    let dial = timeout(
        ctx.config.connect_timeout,
        TcpStream::connect((host, port)),
    )
    .await;
    let target = match dial {
        Ok(Ok(target)) => target,
        Ok(Err(e)) => {
            let _ = session.set_connected(false);
            if let Err(we) = session.write(&CONNECT_FAILURE_REPLY).await {
                warn!(short_id = %short_id, error = %we, "write failure reply");
            }
            return Err(format!("connect to target failed: {e}"));
        }
        Err(_) => {
            let _ = session.set_connected(false);
            if let Err(we) = session.write(&CONNECT_FAILURE_REPLY).await {
                warn!(short_id = %short_id, error = %we, "write failure reply");
            }
            return Err("connect to target timed out".to_owned());
        }
    };

    let target_log = if atyp.is_domain() {
        match target.peer_addr() {
            Ok(addr) => format!("{host}:{port}({addr})"),
            Err(_) => format!("{host}:{port}"),
        }
    } else {
        format!("{host}:{port}")
    };
    info!(
        short_id = %short_id,
        local = ?session.peer_addr(),
        remote = %target_log,
        "direct established"
    );

    session
        .set_connected(true)
        .map_err(|e| format!("set connected: {e}"))?;
    session
        .write(&CONNECT_SUCCESS_REPLY)
        .await
        .map_err(|e| format!("write success reply: {e}"))?;

    let done = DirectForwarder::new(Arc::clone(session), target).run().await;
    if is_graceful_done(&done) {
        info!(short_id = %short_id, remote = %target_log, done = %done, "direct finished");
        Ok(())
    } else {
        Err(format!("direct done with error: {done}"))
    }
}

/// Proxy path: register the session and pump it over the bridge
///
/// The SOCKS5 reply is *not* written here — the remote peer's ConnectAck
/// drives it through the demultiplexer.
async fn handle_proxy(
    ctx: &ConnContext,
    session: &Arc<Session>,
    host: &str,
    port: u16,
    atyp: AddrType,
) -> Result<(), String> {
    let short_id = session.short_id().to_owned();
    debug!(short_id = %short_id, target = %format!("{host}:{port}"), "proxy start");

    let Some(transport) = ctx.transport.clone() else {
        return Err("bridge transport unavailable".to_owned());
    };

    session
        .set_target(host, port, atyp, RouteMode::Proxy)
        .map_err(|e| format!("set target: {e}"))?;

    ctx.registry.add(Arc::clone(session));
    let forwarder = ProxyForwarder::new(
        Arc::clone(session),
        transport,
        ctx.config.client_id.clone(),
        ctx.config.server_type,
    );

    info!(
        short_id = %short_id,
        local = ?session.peer_addr(),
        remote = %format!("{host}:{port}"),
        "proxy established"
    );

    let done = forwarder.run().await;
    ctx.registry.remove_and_close(session.conn_id()).await;

    if is_graceful_done(&done) {
        info!(short_id = %short_id, done = %done, "proxy finished");
        Ok(())
    } else {
        Err(format!("proxy done with error: {done}"))
    }
}
