//! Proxy-path byte pump
//!
//! A single client-read pipe: chunks read from the session are published
//! as `Data` frames over the bridge transport. There is no reverse pipe —
//! target→client traffic arrives as inbound bridge frames and is written
//! through the session registry by the demultiplexer.
//!
//! Before any data flows, the forwarder announces the session to the
//! remote peer with an explicit `Connect` frame carrying the target
//! host, port and address type.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};

use super::direct::{CLOSE_SIGNAL_DONE, MAX_WRITE_RETRIES, PIPE_BUF_SIZE};
use super::session::Session;
use super::wire::RouteMode;
use crate::bridge::codec::{frame_flag, frame_type, Notification};
use crate::bridge::Transport;

/// Client-side pump for a bridged session
pub struct ProxyForwarder {
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    client_id: String,
    server_type: u8,
}

impl ProxyForwarder {
    /// Create a forwarder publishing the session's bytes over the bridge
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        transport: Arc<dyn Transport>,
        client_id: impl Into<String>,
        server_type: u8,
    ) -> Self {
        info!(short_id = %session.short_id(), "proxy forwarder created");
        Self {
            session,
            transport,
            client_id: client_id.into(),
            server_type,
        }
    }

    /// Pump the client-read pipe until termination
    ///
    /// Returns the done message; the acceptor classifies it with
    /// [`super::direct::is_graceful_done`].
    pub async fn run(self) -> String {
        let session = self.session;
        let short_id = session.short_id().to_owned();
        let target = session.target();

        if target.mode != RouteMode::Proxy {
            error!(short_id = %short_id, "proxy forwarder refused, session not proxied");
            return "session is not proxied".to_owned();
        }

        // Announce the target before any data so the remote peer never has
        // to infer it from the first chunk.
        let connect = Notification {
            code: 0,
            message: String::new(),
            addr: target.host.clone(),
            port: target.port,
            atyp: target.atyp.as_byte(),
        };
        if let Err(e) = self.transport.send(
            frame_type::CONNECT,
            frame_flag::TO_SERVER,
            &self.client_id,
            session.conn_id(),
            self.server_type,
            Some(&connect.encode()),
        ) {
            error!(short_id = %short_id, error = %e, "proxy connect frame failed");
            return format!("write connect error: {e}");
        }
        debug!(
            short_id = %short_id,
            target = %format!("{}:{}", target.host, target.port),
            "proxy connect frame sent"
        );

        let retries = AtomicU32::new(0);
        let mut buf = vec![0u8; PIPE_BUF_SIZE];
        let mut close_rx = session.close_signal();

        let message = 'pipe: loop {
            let n = tokio::select! {
                biased;
                _ = close_rx.wait_for(|closed| *closed) => {
                    debug!(short_id = %short_id, "proxy pipe ended by close signal");
                    break 'pipe CLOSE_SIGNAL_DONE.to_owned();
                }
                result = session.read(&mut buf) => match result {
                    Ok(0) => {
                        debug!(short_id = %short_id, "proxy pipe read EOF");
                        break 'pipe "read EOF".to_owned();
                    }
                    Ok(n) => n,
                    Err(e) => {
                        error!(short_id = %short_id, error = %e, "proxy pipe read error");
                        break 'pipe format!("read error: {e}");
                    }
                },
            };

            loop {
                match self.transport.send(
                    frame_type::DATA,
                    frame_flag::TO_SERVER,
                    &self.client_id,
                    session.conn_id(),
                    self.server_type,
                    Some(&buf[..n]),
                ) {
                    Ok(()) => {
                        retries.store(0, Ordering::Release);
                        break;
                    }
                    Err(e) => {
                        error!(short_id = %short_id, error = %e, "proxy pipe write error");
                        if retries.fetch_add(1, Ordering::AcqRel) + 1 >= MAX_WRITE_RETRIES {
                            break 'pipe format!("write error: {e}");
                        }
                    }
                }
            }
        };

        debug!(short_id = %short_id, done = %message, "proxy forwarder done");
        message
    }
}
