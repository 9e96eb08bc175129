// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP transport.
//!
//! Stream-oriented carrier with connection management: an accept loop
//! for the server role, on-demand outgoing connections for the client
//! role, and one reader thread per connection feeding a
//! [`StreamFramer`](crate::transport::framer::StreamFramer). Message
//! boundaries are entirely the framer's business; this module moves
//! bytes and tracks connections.

use crate::config::TcpConfig;
use crate::error::{Error, ResourceError, Result};
use crate::protocol::message::Message;
use crate::transport::framer::StreamFramer;
use crate::transport::{ReceiveQueue, TransportListener, TransportStats};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Poll interval of the non-blocking accept loop.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// State shared between the facade, the accept loop and reader threads.
struct Shared {
    cfg: TcpConfig,
    connections: Mutex<HashMap<SocketAddr, TcpStream>>,
    reader_handles: Mutex<Vec<JoinHandle<()>>>,
    tx: Sender<(Message, SocketAddr)>,
    listener: Mutex<Option<TransportListener>>,
    stats: TransportStats,
    shutdown: AtomicBool,
}

/// Bidirectional TCP message transport.
pub struct TcpTransport {
    local_addr: SocketAddr,
    acceptor: Mutex<Option<TcpListener>>,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    rx: Receiver<(Message, SocketAddr)>,
    shared: Arc<Shared>,
    started: AtomicBool,
}

impl TcpTransport {
    /// Bind the listening socket. Port 0 auto-assigns; a client-only
    /// transport simply never receives an inbound connection.
    pub fn bind(local: SocketAddr, cfg: TcpConfig) -> Result<Self> {
        let acceptor = TcpListener::bind(local)?;
        acceptor.set_nonblocking(true)?;
        let local_addr = acceptor.local_addr()?;

        let (tx, rx) = unbounded();
        Ok(Self {
            local_addr,
            acceptor: Mutex::new(Some(acceptor)),
            accept_handle: Mutex::new(None),
            rx,
            shared: Arc::new(Shared {
                cfg,
                connections: Mutex::new(HashMap::new()),
                reader_handles: Mutex::new(Vec::new()),
                tx,
                listener: Mutex::new(None),
                stats: TransportStats::default(),
                shutdown: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the accept loop. Idempotent.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.shutdown.store(false, Ordering::Relaxed);

        let acceptor = match self.acceptor.lock().take() {
            Some(a) => a,
            None => return Err(Error::State("transport already consumed its listener")),
        };
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("hsip-tcp-accept".to_string())
            .spawn(move || accept_loop(&acceptor, &shared))
            .map_err(Error::Network)?;
        *self.accept_handle.lock() = Some(handle);
        log::debug!("[TCP] transport started on {}", self.local_addr);
        Ok(())
    }

    /// Close every connection and join all worker threads.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        self.started.store(false, Ordering::SeqCst);

        for (peer, stream) in self.shared.connections.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
            log::debug!("[TCP] closed connection to {}", peer);
        }
        if let Some(handle) = self.accept_handle.lock().take() {
            let _ = handle.join();
        }
        for handle in self.shared.reader_handles.lock().drain(..) {
            let _ = handle.join();
        }
        log::debug!("[TCP] transport stopped on {}", self.local_addr);
    }

    /// Encode and send one message, connecting to `peer` on demand.
    pub fn send(&self, msg: &Message, peer: SocketAddr) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::State("transport not started"));
        }

        let mut stream = self.writer_for(peer)?;
        let encoded = msg.encode();
        match stream.write_all(&encoded) {
            Ok(()) => {
                self.shared.stats.record_sent(encoded.len());
                Ok(())
            }
            Err(e) => {
                // A dead connection is dropped so the next send redials.
                self.shared.connections.lock().remove(&peer);
                self.shared.stats.record_send_error();
                log::debug!("[TCP] send to {} failed: {}", peer, e);
                Err(Error::Network(e))
            }
        }
    }

    /// Existing writer half for `peer`, or a fresh outgoing connection.
    fn writer_for(&self, peer: SocketAddr) -> Result<TcpStream> {
        if let Some(stream) = self.shared.connections.lock().get(&peer) {
            return stream.try_clone().map_err(Error::Network);
        }

        {
            let connections = self.shared.connections.lock();
            if connections.len() >= self.shared.cfg.max_connections {
                return Err(Error::Resource(ResourceError::ConnectionsExhausted));
            }
        }

        let stream = TcpStream::connect_timeout(&peer, self.shared.cfg.connect_timeout)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::TimedOut {
                    Error::Timeout(crate::error::TimeoutKind::Connect)
                } else {
                    Error::Network(e)
                }
            })?;
        configure_stream(&stream, &self.shared.cfg)?;
        log::debug!("[TCP] connected to {}", peer);

        register_connection(&self.shared, peer, &stream)?;
        stream.try_clone().map_err(Error::Network)
    }

    pub fn receive(&self) -> Option<(Message, SocketAddr)> {
        self.rx.try_recv().ok()
    }

    pub fn receive_timeout(&self, timeout: Duration) -> Option<(Message, SocketAddr)> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn set_listener(&self, listener: TransportListener) {
        *self.shared.listener.lock() = Some(listener);
    }

    pub fn receive_queue(&self) -> ReceiveQueue {
        self.rx.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    pub fn stats(&self) -> &TransportStats {
        &self.shared.stats
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Apply timeouts, keep-alive and NODELAY to a fresh stream.
fn configure_stream(stream: &TcpStream, cfg: &TcpConfig) -> Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(cfg.receive_timeout))?;
    stream.set_write_timeout(Some(cfg.send_timeout))?;
    if cfg.keep_alive {
        let keepalive = TcpKeepalive::new().with_time(cfg.keep_alive_interval);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

/// Track a connection and spawn its reader thread.
fn register_connection(shared: &Arc<Shared>, peer: SocketAddr, stream: &TcpStream) -> Result<()> {
    let reader = stream.try_clone().map_err(Error::Network)?;
    shared
        .connections
        .lock()
        .insert(peer, stream.try_clone().map_err(Error::Network)?);

    let shared_for_reader = Arc::clone(shared);
    let handle = thread::Builder::new()
        .name("hsip-tcp-rx".to_string())
        .spawn(move || connection_loop(reader, peer, &shared_for_reader))
        .map_err(Error::Network)?;
    shared.reader_handles.lock().push(handle);
    Ok(())
}

fn accept_loop(acceptor: &TcpListener, shared: &Arc<Shared>) {
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        match acceptor.accept() {
            Ok((stream, peer)) => {
                if shared.connections.lock().len() >= shared.cfg.max_connections {
                    log::debug!("[TCP] refusing {}: connection table full", peer);
                    shared.stats.record_recv_error();
                    let _ = stream.shutdown(Shutdown::Both);
                    continue;
                }
                if let Err(e) = configure_stream(&stream, &shared.cfg) {
                    log::debug!("[TCP] failed to configure {}: {}", peer, e);
                    continue;
                }
                log::debug!("[TCP] accepted connection from {}", peer);
                if let Err(e) = register_connection(shared, peer, &stream) {
                    log::debug!("[TCP] failed to register {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::debug!("[TCP] accept error: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Per-connection reader: bytes -> framer -> channel.
fn connection_loop(mut stream: TcpStream, peer: SocketAddr, shared: &Arc<Shared>) {
    let mut framer = StreamFramer::new(
        shared.cfg.max_receive_buffer,
        shared.cfg.max_receive_buffer,
    );
    let mut buf = vec![0u8; 8192];

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            break;
        }
        let len = match stream.read(&mut buf) {
            Ok(0) => {
                log::debug!("[TCP] {} closed the connection", peer);
                break;
            }
            Ok(len) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::debug!("[TCP] read from {} failed: {}", peer, e);
                shared.stats.record_recv_error();
                break;
            }
        };

        framer.feed(&buf[..len]);
        while let Some(msg) = framer.decode_buffered() {
            shared.stats.record_received(msg.encoded_size());
            if let Some(hook) = shared.listener.lock().clone() {
                hook(&msg, peer);
            }
            if shared.tx.send((msg, peer)).is_err() {
                return;
            }
        }
    }
    shared.connections.lock().remove(&peer);
}
