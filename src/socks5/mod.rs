//! SOCKS5 inbound side of the proxy
//!
//! - [`wire`]: protocol byte constants and canned replies
//! - [`allowlist`]: host allowlist deciding the direct route
//! - [`session`]: per-connection state with close-once semantics
//! - [`registry`]: concurrent session map used by the demultiplexer
//! - [`server`]: acceptor and handshake state machine
//! - [`direct`]: two-pipe forwarder for allowlisted targets
//! - [`proxy`]: client-read pump for bridged sessions

pub mod allowlist;
pub mod direct;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod session;
pub mod wire;

pub use allowlist::HostAllowlist;
pub use direct::{is_graceful_done, DirectForwarder, CLOSE_SIGNAL_DONE};
pub use proxy::ProxyForwarder;
pub use registry::SessionRegistry;
pub use server::{Socks5Server, Socks5ServerConfig};
pub use session::{AttrValue, Session, Target};
pub use wire::{AddrType, RouteMode};
