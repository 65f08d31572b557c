//! Bridge link to the remote peer
//!
//! Proxied sessions are multiplexed over one long-lived WebSocket
//! connection. This module holds the framing codec, the reconnecting
//! transport, and the inbound demultiplexer, glued together by two small
//! traits so neither side owns the other:
//!
//! - [`Transport`] is the sending seam the forwarders and acceptor hold.
//! - [`Receiver`] is the inbound seam the transport delivers frames to;
//!   the demultiplexer implements it and owns the registry handle.

use async_trait::async_trait;

use crate::error::BridgeError;

pub mod codec;
pub mod receiver;
pub mod transport;

pub use codec::{decode, encode, Frame, FrameExtension, FrameHeader, Notification};
pub use receiver::BridgeReceiver;
pub use transport::{WsTransport, WsTransportConfig};

/// Sending side of the bridge link
pub trait Transport: Send + Sync {
    /// Encode one frame and offer it to the link without blocking
    ///
    /// # Errors
    ///
    /// Fails when the transport is closed, the payload is missing, or the
    /// bounded send queue is full (the frame is dropped).
    fn send(
        &self,
        frame_type: u8,
        flag: u8,
        client_id: &str,
        conn_id: &str,
        server_type: u8,
        payload: Option<&[u8]>,
    ) -> Result<(), BridgeError>;

    /// Close the transport; idempotent and safe to call concurrently
    fn close(&self);
}

/// Inbound side of the bridge link
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Handle one raw inbound frame
    async fn on_received(&self, data: Vec<u8>);

    /// The link dropped; sessions riding it will not survive a reconnect
    async fn on_disconnected(&self);
}
