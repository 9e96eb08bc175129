// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transports: unicast datagrams and the multicast flavor used by
//! Service Discovery.
//!
//! One message per datagram. The receive loop runs on a dedicated
//! thread, decodes each datagram and hands `(Message, sender)` pairs to
//! the channel and the optional listener hook.

use crate::config::MAX_UDP_PAYLOAD;
use crate::error::{Error, Result};
use crate::protocol::message::Message;
use crate::transport::multicast::join_multicast_group;
use crate::transport::{ReceiveQueue, TransportListener, TransportStats};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Socket read timeout of the receive loops; bounds shutdown latency.
const RECV_POLL: Duration = Duration::from_millis(100);

/// Upper bound on a blocking send.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Datagram transport over a single UDP socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    /// Multicast group joined by the SD flavor, `None` for unicast.
    group: Option<SocketAddrV4>,
    rx: Receiver<(Message, SocketAddr)>,
    tx: Sender<(Message, SocketAddr)>,
    listener: Arc<Mutex<Option<TransportListener>>>,
    stats: Arc<TransportStats>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind a unicast socket. Port 0 auto-assigns.
    pub fn bind(local: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
        let socket: UdpSocket = socket.into();
        Self::from_socket(socket, None)
    }

    /// Bind the multicast flavor: the socket listens on the group port
    /// with SO_REUSEADDR and joins `group` on every usable interface.
    pub fn bind_multicast(group: Ipv4Addr, port: u16) -> Result<Self> {
        if !group.is_multicast() {
            return Err(Error::State("address is not in the multicast range"));
        }
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(SockProtocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
        let socket: UdpSocket = socket.into();

        let iface = join_multicast_group(&socket, group)?;
        log::debug!(
            "[UDP] multicast transport joined {}:{} (iface {})",
            group,
            port,
            iface
        );
        Self::from_socket(socket, Some(SocketAddrV4::new(group, port)))
    }

    fn from_socket(socket: UdpSocket, group: Option<SocketAddrV4>) -> Result<Self> {
        socket.set_read_timeout(Some(RECV_POLL))?;
        socket.set_write_timeout(Some(SEND_TIMEOUT))?;
        let local_addr = socket.local_addr()?;
        let (tx, rx) = unbounded();
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            group,
            rx,
            tx,
            listener: Arc::new(Mutex::new(None)),
            stats: Arc::new(TransportStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    /// Spawn the receive loop. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::Relaxed);

        let socket = Arc::clone(&self.socket);
        let tx = self.tx.clone();
        let listener = Arc::clone(&self.listener);
        let stats = Arc::clone(&self.stats);
        let shutdown = Arc::clone(&self.shutdown);
        let name = if self.group.is_some() {
            "hsip-mcast-rx"
        } else {
            "hsip-udp-rx"
        };

        let joined = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || receive_loop(&socket, &tx, &listener, &stats, &shutdown))
            .map_err(Error::Network)?;
        *handle = Some(joined);
        log::debug!("[UDP] transport started on {}", self.local_addr);
        Ok(())
    }

    /// Stop the receive loop and wait for it to exit.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        log::debug!("[UDP] transport stopped on {}", self.local_addr);
    }

    fn is_running(&self) -> bool {
        self.handle.lock().is_some() && !self.shutdown.load(Ordering::Relaxed)
    }

    /// Encode and send one message to `peer`.
    pub fn send(&self, msg: &Message, peer: SocketAddr) -> Result<()> {
        if !self.is_running() {
            return Err(Error::State("transport not started"));
        }
        if msg.payload.len() > MAX_UDP_PAYLOAD {
            return Err(Error::Resource(
                crate::error::ResourceError::MessageTooLarge {
                    size: msg.payload.len(),
                    max: MAX_UDP_PAYLOAD,
                },
            ));
        }
        let encoded = msg.encode();
        let sent = self.socket.send_to(&encoded, peer).map_err(|e| {
            self.stats.record_send_error();
            log::debug!("[UDP] send to {} failed: {}", peer, e);
            Error::Network(e)
        })?;
        self.stats.record_sent(sent);
        Ok(())
    }

    /// Send to the joined group (multicast flavor only).
    pub fn send_to_group(&self, msg: &Message) -> Result<()> {
        match self.group {
            Some(group) => self.send(msg, SocketAddr::V4(group)),
            None => Err(Error::State("transport has no multicast group")),
        }
    }

    /// Pop the next received message without blocking.
    pub fn receive(&self) -> Option<(Message, SocketAddr)> {
        self.rx.try_recv().ok()
    }

    /// Pop the next received message, waiting up to `timeout`.
    pub fn receive_timeout(&self, timeout: Duration) -> Option<(Message, SocketAddr)> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Install the inbound listener hook, replacing any previous one.
    pub fn set_listener(&self, listener: TransportListener) {
        *self.listener.lock() = Some(listener);
    }

    /// Clone of the receive channel, for dispatch loops.
    pub fn receive_queue(&self) -> ReceiveQueue {
        self.rx.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn multicast_group(&self) -> Option<SocketAddrV4> {
        self.group
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Reject datagrams from nonsensical sources before decoding.
fn is_valid_source(addr: &SocketAddr) -> bool {
    !addr.ip().is_unspecified() && addr.port() != 0
}

fn receive_loop(
    socket: &UdpSocket,
    tx: &Sender<(Message, SocketAddr)>,
    listener: &Mutex<Option<TransportListener>>,
    stats: &TransportStats,
    shutdown: &AtomicBool,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::debug!("[UDP] recv error: {}", e);
                stats.record_recv_error();
                continue;
            }
        };

        if !is_valid_source(&from) {
            log::debug!("[UDP] dropping datagram from invalid source {}", from);
            stats.record_recv_error();
            continue;
        }

        match Message::decode(&buf[..len]) {
            Ok(msg) => {
                stats.record_received(len);
                if let Some(hook) = listener.lock().clone() {
                    hook(&msg, from);
                }
                if tx.send((msg, from)).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::debug!("[UDP] dropping malformed datagram from {}: {}", from, e);
                stats.record_decode_error();
            }
        }
    }
}
