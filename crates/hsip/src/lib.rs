// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HSIP - High-performance SOME/IP
//!
//! A pure Rust implementation of the SOME/IP service-oriented
//! middleware stack (AUTOSAR PRS): request/response RPC, event
//! publish/subscribe, dynamic Service Discovery over UDP multicast,
//! and SOME/IP-TP segmentation for payloads beyond the link MTU, over
//! both UDP and TCP.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hsip::rpc::RpcServer;
//! use hsip::transport::Transport;
//! use hsip::dispatch::Dispatcher;
//! use hsip::config::TpConfig;
//! use std::sync::Arc;
//!
//! fn main() -> hsip::Result<()> {
//!     // Serve a method on service 0x1000 over UDP.
//!     let transport = Arc::new(Transport::udp("0.0.0.0:30509".parse().unwrap())?);
//!     let server = Arc::new(RpcServer::new(0x1000, 0x01));
//!     server.register(0x0001, |params| Ok(params.to_vec()));
//!
//!     let dispatcher = Dispatcher::new(Arc::clone(&transport), TpConfig::default());
//!     dispatcher.attach_server(server);
//!     dispatcher.start()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     Application Layer                        |
//! |     RpcClient / RpcServer / EventBus / EventConsumer         |
//! +--------------------------------------------------------------+
//! |                      Protocol Layer                          |
//! |  Message Codec | Serializer | SD Entries/Options | TP        |
//! +--------------------------------------------------------------+
//! |                     Transport Layer                          |
//! |  UDP Unicast | UDP Multicast (SD) | TCP + Stream Framer      |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`protocol`] - wire format: header codec, serializer, SD body
//! - [`transport`] - UDP/multicast/TCP carriers and the stream framer
//! - [`tp`] - segmentation and out-of-order reassembly
//! - [`rpc`] - request/response correlation and method dispatch
//! - [`sd`] - offer/find/subscribe engine with timed re-offers
//! - [`events`] - event fan-out, fields, periodic publication
//!
//! ## See Also
//!
//! - [SOME/IP Protocol Specification](https://www.autosar.org/fileadmin/standards/R22-11/FO/AUTOSAR_PRS_SOMEIPProtocol.pdf)
//! - [SOME/IP Service Discovery Protocol Specification](https://www.autosar.org/fileadmin/standards/R22-11/FO/AUTOSAR_PRS_SOMEIPServiceDiscoveryProtocol.pdf)

/// Global configuration: protocol constants and config records.
pub mod config;
/// Inbound message routing between the protocol layers.
pub mod dispatch;
/// Endpoint addressing (`protocol://addr:port`).
pub mod endpoint;
/// Crate-wide error taxonomy.
pub mod error;
/// Event distribution (bus, consumer, subscription states).
pub mod events;
/// SOME/IP wire protocol (codec, serializer, SD body).
pub mod protocol;
/// RPC correlator (client and server side).
pub mod rpc;
/// Service Discovery engine.
pub mod sd;
/// Session id allocation.
pub mod session;
/// SOME/IP-TP segmentation sublayer.
pub mod tp;
/// Transport layer (UDP, multicast, TCP, framer).
pub mod transport;

pub use config::Config;
pub use endpoint::{Endpoint, Protocol};
pub use error::{Error, Result};
pub use protocol::{Message, MessageId, MessageType, RequestId, ReturnCode};
pub use session::SessionManager;

/// HSIP version string.
pub const VERSION: &str = "0.3.2";

#[cfg(test)]
mod tests {
    #[test]
    fn version_matches_manifest() {
        assert_eq!(super::VERSION, env!("CARGO_PKG_VERSION"));
    }
}
