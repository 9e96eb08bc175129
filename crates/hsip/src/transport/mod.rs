// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport layer: UDP unicast, UDP multicast and TCP behind one
//! tagged-variant interface.
//!
//! Every flavor offers the same surface: `send(msg, peer)`, a
//! non-blocking `receive`, `start`/`stop` lifecycle and an optional
//! listener hook invoked on the receive thread. Each running transport
//! owns exactly one receive-loop thread; blocking happens only there,
//! bounded by the socket read timeout.
//!
//! # Modules
//!
//! - `udp` - datagram sockets, unicast and multicast flavors
//! - `multicast` - group join and interface discovery helpers
//! - `tcp` - connection management for the stream flavor
//! - `framer` - message-boundary reconstruction for TCP

/// Message framing for stream transports.
pub mod framer;
/// Multicast group management and interface discovery.
pub mod multicast;
/// TCP connection management.
pub mod tcp;
/// UDP socket management.
pub mod udp;

pub use framer::{FramerStats, StreamFramer};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use crate::config::TcpConfig;
use crate::error::Result;
use crate::protocol::message::Message;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Hook invoked on the receive thread for every decoded message.
pub type TransportListener = Arc<dyn Fn(&Message, SocketAddr) + Send + Sync>;

/// Clonable handle on a transport's receive channel.
pub type ReceiveQueue = crossbeam::channel::Receiver<(Message, SocketAddr)>;

/// Per-transport traffic counters.
#[derive(Debug, Default)]
pub struct TransportStats {
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
    received_messages: AtomicU64,
    received_bytes: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
    decode_errors: AtomicU64,
}

impl TransportStats {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        self.sent_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.received_messages.fetch_add(1, Ordering::Relaxed);
        self.received_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent_messages(&self) -> u64 {
        self.sent_messages.load(Ordering::Relaxed)
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn received_messages(&self) -> u64 {
        self.received_messages.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    pub fn recv_errors(&self) -> u64 {
        self.recv_errors.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }
}

/// The three transport flavors behind one interface.
///
/// Dispatch is a pattern match on the tag; no virtual call layer.
pub enum Transport {
    Udp(UdpTransport),
    Multicast(UdpTransport),
    Tcp(TcpTransport),
}

impl Transport {
    /// Unicast UDP bound to `local`.
    pub fn udp(local: SocketAddr) -> Result<Self> {
        Ok(Transport::Udp(UdpTransport::bind(local)?))
    }

    /// Multicast UDP joined to `group:port`; used exclusively by SD.
    pub fn multicast(group: Ipv4Addr, port: u16) -> Result<Self> {
        Ok(Transport::Multicast(UdpTransport::bind_multicast(
            group, port,
        )?))
    }

    /// TCP bound to `local`.
    pub fn tcp(local: SocketAddr, cfg: TcpConfig) -> Result<Self> {
        Ok(Transport::Tcp(TcpTransport::bind(local, cfg)?))
    }

    /// Build the flavor named by an endpoint string
    /// (`udp://...`, `tcp://...`, `multicast://...`).
    pub fn from_endpoint(ep: &crate::endpoint::Endpoint, tcp_cfg: TcpConfig) -> Result<Self> {
        use crate::endpoint::Protocol;
        match ep.protocol {
            Protocol::Udp => Self::udp(ep.socket_addr()),
            Protocol::Tcp => Self::tcp(ep.socket_addr(), tcp_cfg),
            Protocol::Multicast => match ep.addr {
                std::net::IpAddr::V4(group) => Self::multicast(group, ep.port),
                std::net::IpAddr::V6(_) => {
                    Err(crate::error::Error::State("multicast endpoints are IPv4"))
                }
            },
        }
    }

    pub fn start(&self) -> Result<()> {
        match self {
            Transport::Udp(t) | Transport::Multicast(t) => t.start(),
            Transport::Tcp(t) => t.start(),
        }
    }

    pub fn stop(&self) {
        match self {
            Transport::Udp(t) | Transport::Multicast(t) => t.stop(),
            Transport::Tcp(t) => t.stop(),
        }
    }

    pub fn send(&self, msg: &Message, peer: SocketAddr) -> Result<()> {
        match self {
            Transport::Udp(t) | Transport::Multicast(t) => t.send(msg, peer),
            Transport::Tcp(t) => t.send(msg, peer),
        }
    }

    pub fn receive(&self) -> Option<(Message, SocketAddr)> {
        match self {
            Transport::Udp(t) | Transport::Multicast(t) => t.receive(),
            Transport::Tcp(t) => t.receive(),
        }
    }

    pub fn receive_timeout(&self, timeout: Duration) -> Option<(Message, SocketAddr)> {
        match self {
            Transport::Udp(t) | Transport::Multicast(t) => t.receive_timeout(timeout),
            Transport::Tcp(t) => t.receive_timeout(timeout),
        }
    }

    pub fn set_listener(&self, listener: TransportListener) {
        match self {
            Transport::Udp(t) | Transport::Multicast(t) => t.set_listener(listener),
            Transport::Tcp(t) => t.set_listener(listener),
        }
    }

    pub fn receive_queue(&self) -> ReceiveQueue {
        match self {
            Transport::Udp(t) | Transport::Multicast(t) => t.receive_queue(),
            Transport::Tcp(t) => t.receive_queue(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Transport::Udp(t) | Transport::Multicast(t) => t.local_addr(),
            Transport::Tcp(t) => t.local_addr(),
        }
    }

    pub fn stats(&self) -> &TransportStats {
        match self {
            Transport::Udp(t) | Transport::Multicast(t) => t.stats(),
            Transport::Tcp(t) => t.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{MessageId, MessageType, RequestId};
    use std::net::IpAddr;

    #[test]
    fn facade_round_trip_over_udp() {
        let a = Transport::udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
        let b = Transport::udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
        a.start().unwrap();
        b.start().unwrap();

        let msg = Message::new(
            MessageId::new(0x42, 0x01),
            RequestId::new(1, 2),
            MessageType::Notification,
            b"via facade".to_vec(),
        );
        a.send(&msg, b.local_addr()).unwrap();
        let (received, _) = b.receive_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, msg);
        assert_eq!(a.stats().sent_messages(), 1);

        a.stop();
        b.stop();
    }

    #[test]
    fn from_endpoint_picks_the_flavor() {
        let udp: crate::endpoint::Endpoint = "udp://127.0.0.1:0".parse().unwrap();
        let t = Transport::from_endpoint(&udp, TcpConfig::default()).unwrap();
        assert!(matches!(t, Transport::Udp(_)));

        let tcp: crate::endpoint::Endpoint = "tcp://127.0.0.1:0".parse().unwrap();
        let t = Transport::from_endpoint(&tcp, TcpConfig::default()).unwrap();
        assert!(matches!(t, Transport::Tcp(_)));
    }

    #[test]
    fn stats_start_at_zero() {
        let stats = TransportStats::default();
        assert_eq!(stats.sent_messages(), 0);
        assert_eq!(stats.received_bytes(), 0);
        assert_eq!(stats.decode_errors(), 0);
    }
}
