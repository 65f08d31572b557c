//! Integration tests for socks5-bridge
//!
//! # Test Organization
//!
//! - `socks5_e2e`: direct-path scenarios against real loopback targets
//!   (handshake acceptance and rejection, IPv4/domain/IPv6 dialing,
//!   half-close draining)
//! - `bridge_e2e`: proxy-path scenarios against a mock WebSocket peer
//!   (deferred ConnectAck replies, data round trips, teardown on close
//!   and on link drop)

pub mod bridge_e2e;
pub mod socks5_e2e;
