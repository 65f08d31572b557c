//! Inbound bridge frame demultiplexer
//!
//! Validates each decoded frame (this client's ID, inbound flag, known
//! type, registered session) and dispatches it: `Data` is written into the
//! session, `ConnectAck` gates the deferred SOCKS5 reply, `Close`/`Error`
//! tear the session down. Invalid frames are logged and dropped; they
//! never disturb other sessions.
//!
//! Every received frame gets a wrapping six-digit trace ID used only for
//! log correlation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::codec::{self, frame_flag, frame_type, Notification};
use super::Receiver;
use crate::socks5::registry::SessionRegistry;
use crate::socks5::wire::{CONNECT_FAILURE_REPLY, CONNECT_SUCCESS_REPLY};

/// Demultiplexer for frames arriving from the remote peer
pub struct BridgeReceiver {
    client_id: String,
    registry: Arc<SessionRegistry>,
    trace_counter: AtomicU32,
}

impl BridgeReceiver {
    /// Create a receiver for this proxy instance
    #[must_use]
    pub fn new(client_id: impl Into<String>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            client_id: client_id.into(),
            registry,
            trace_counter: AtomicU32::new(0),
        }
    }

    /// Mint the next wrapping six-digit trace ID
    fn next_trace_id(&self) -> String {
        let previous = self
            .trace_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(if v >= 999_999 { 0 } else { v + 1 })
            })
            .unwrap_or(0);
        let current = if previous >= 999_999 { 0 } else { previous + 1 };
        format!("{current:06}")
    }

    #[cfg(test)]
    fn set_trace_counter(&self, value: u32) {
        self.trace_counter.store(value, Ordering::Release);
    }

    async fn handle_data(&self, trace_id: &str, conn_id: &str, payload: &[u8]) {
        debug!(trace = %trace_id, "recv data");
        match self.registry.write_if_connected(conn_id, payload).await {
            Ok(n) => debug!(trace = %trace_id, bytes = n, "recv data written"),
            Err(e) => {
                error!(trace = %trace_id, error = %e, "recv data write failed");
                self.registry.remove_and_close(conn_id).await;
            }
        }
    }

    async fn handle_connect_ack(&self, trace_id: &str, conn_id: &str, payload: &[u8]) {
        debug!(trace = %trace_id, "recv connect ack");
        let notif = match Notification::decode(payload) {
            Ok(notif) => notif,
            Err(e) => {
                error!(trace = %trace_id, error = %e, "recv connect ack decode failed");
                return;
            }
        };

        let Some(session) = self.registry.get(conn_id) else {
            error!(trace = %trace_id, "recv connect ack, session vanished");
            return;
        };

        let reply: &[u8] = if notif.code == 0 {
            debug!(
                trace = %trace_id,
                addr = %notif.addr,
                port = notif.port,
                "recv connect ack success"
            );
            if let Err(e) = session.set_connected(true) {
                warn!(trace = %trace_id, error = %e, "recv connect ack, connected flag");
            }
            &CONNECT_SUCCESS_REPLY
        } else {
            error!(
                trace = %trace_id,
                code = notif.code,
                message = %notif.message,
                "recv connect ack failure"
            );
            if let Err(e) = session.set_connected(false) {
                warn!(trace = %trace_id, error = %e, "recv connect ack, connected flag");
            }
            &CONNECT_FAILURE_REPLY
        };

        match self.registry.write(conn_id, reply).await {
            Ok(n) => {
                debug!(trace = %trace_id, bytes = n, "recv connect ack reply written");
                if notif.code != 0 {
                    // The client saw the failure reply; nothing else will
                    // arrive for this session.
                    self.registry.remove_and_close(conn_id).await;
                }
            }
            Err(e) => {
                error!(trace = %trace_id, error = %e, "recv connect ack reply failed");
                self.registry.remove_and_close(conn_id).await;
            }
        }
    }

    async fn handle_close(&self, trace_id: &str, conn_id: &str, payload: &[u8]) {
        match Notification::decode(payload) {
            Ok(notif) => debug!(
                trace = %trace_id,
                addr = %notif.addr,
                port = notif.port,
                code = notif.code,
                message = %notif.message,
                "recv close"
            ),
            Err(e) => debug!(trace = %trace_id, error = %e, "recv close, bad notification"),
        }
        self.registry.remove_and_close(conn_id).await;
        debug!(trace = %trace_id, "recv close, session closed");
    }

    async fn handle_error(&self, trace_id: &str, conn_id: &str, payload: &[u8]) {
        match Notification::decode(payload) {
            Ok(notif) => error!(
                trace = %trace_id,
                addr = %notif.addr,
                port = notif.port,
                code = notif.code,
                message = %notif.message,
                "recv error notification"
            ),
            Err(e) => error!(trace = %trace_id, error = %e, "recv error, bad notification"),
        }
        self.registry.remove_and_close(conn_id).await;
        debug!(trace = %trace_id, "recv error, session closed");
    }
}

#[async_trait]
impl Receiver for BridgeReceiver {
    async fn on_received(&self, data: Vec<u8>) {
        let trace_id = self.next_trace_id();
        debug!(trace = %trace_id, bytes = data.len(), "recv");

        if data.is_empty() {
            warn!(trace = %trace_id, "recv dropped, empty message");
            return;
        }

        let frame = match codec::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(trace = %trace_id, error = %e, "recv dropped, decode failed");
                return;
            }
        };
        let header = &frame.header;
        debug!(
            trace = %trace_id,
            frame_type = header.frame_type,
            flag = header.flag,
            conn_id = %header.conn_id,
            server_type = header.server_type,
            "recv decoded"
        );

        if header.client_id != self.client_id {
            error!(
                trace = %trace_id,
                expected = %self.client_id,
                actual = %header.client_id,
                "recv dropped, client ID mismatch"
            );
            return;
        }

        if header.flag != frame_flag::TO_CLIENT {
            error!(trace = %trace_id, flag = header.flag, "recv dropped, illegal flag");
            return;
        }

        if !matches!(
            header.frame_type,
            frame_type::CONNECT_ACK | frame_type::DATA | frame_type::CLOSE | frame_type::ERROR
        ) {
            warn!(
                trace = %trace_id,
                frame_type = header.frame_type,
                "recv dropped, unknown type"
            );
            return;
        }

        if !self.registry.exists(&header.conn_id) {
            error!(trace = %trace_id, conn_id = %header.conn_id, "recv dropped, unknown session");
            return;
        }

        match header.frame_type {
            frame_type::DATA => {
                self.handle_data(&trace_id, &header.conn_id, &frame.payload)
                    .await;
            }
            frame_type::CONNECT_ACK => {
                self.handle_connect_ack(&trace_id, &header.conn_id, &frame.payload)
                    .await;
            }
            frame_type::CLOSE => {
                self.handle_close(&trace_id, &header.conn_id, &frame.payload)
                    .await;
            }
            frame_type::ERROR => {
                self.handle_error(&trace_id, &header.conn_id, &frame.payload)
                    .await;
            }
            _ => unreachable!("validated above"),
        }
    }

    async fn on_disconnected(&self) {
        warn!("bridge link dropped, tearing down proxied sessions");
        self.registry.close_proxied().await;
    }
}
