//! socks5-bridge: local SOCKS5 proxy with a WebSocket bridge
//!
//! A SOCKS5 server (RFC 1928 subset: no-auth, CONNECT) that routes each
//! accepted session one of two ways:
//!
//! - **Direct**: destinations matching the host allowlist are dialed with
//!   a plain TCP socket and relayed bidirectionally.
//! - **Proxy**: everything else is multiplexed over one long-lived
//!   WebSocket link to a remote peer that performs the outbound connect,
//!   with framed messages carrying per-session control and data.
//!
//! # Architecture
//!
//! ```text
//! SOCKS5 client ──> Socks5Server ──┬─ allowlisted ──> DirectForwarder ──> target
//!                                  │
//!                                  └─ otherwise ───> SessionRegistry
//!                                                        │
//!                                      ProxyForwarder ──>│<── BridgeReceiver
//!                                                        │
//!                                                    WsTransport ═══> remote peer
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use socks5_bridge::socks5::{HostAllowlist, SessionRegistry, Socks5Server, Socks5ServerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let allowlist = Arc::new(HostAllowlist::new());
//! allowlist.add("example.com");
//!
//! let registry = Arc::new(SessionRegistry::new());
//! let server = Socks5Server::bind(
//!     Socks5ServerConfig::default(),
//!     allowlist,
//!     registry,
//!     None, // no bridge: only allowlisted destinations are reachable
//! )
//! .await?;
//! server.serve().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: YAML configuration types and loading
//! - [`error`]: error types
//! - [`logging`]: subscriber setup and log rotation
//! - [`socks5`]: acceptor, sessions, registry, allowlist, forwarders
//! - [`bridge`]: framing codec, WebSocket transport, demultiplexer

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod logging;
pub mod socks5;

// Re-export commonly used types at the crate root
pub use bridge::{
    decode, encode, BridgeReceiver, Frame, FrameHeader, Notification, Receiver, Transport,
    WsTransport, WsTransportConfig,
};
pub use config::{load_config, load_config_str, AppConfig, BridgeConfig, LogConfig};
pub use error::{
    BridgeError, CodecError, ConfigError, ProxyError, RegistryError, Result, SessionError,
};
pub use socks5::{
    AddrType, HostAllowlist, RouteMode, Session, SessionRegistry, Socks5Server,
    Socks5ServerConfig,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
