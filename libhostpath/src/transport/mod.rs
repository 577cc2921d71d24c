//! QUIC transport layer for CSI messages.
//!
//! This module provides [`CsiClient`](client::CsiClient) and
//! [`CsiServer`](server::CsiServer) that communicate
//! [`CsiMessage`](crate::message::CsiMessage) values over QUIC bi-directional
//! streams using `quinn`.

pub mod client;
pub mod server;

/// Upper bound on a single serialized request or response.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
