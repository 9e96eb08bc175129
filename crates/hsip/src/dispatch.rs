// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound message demultiplexer.
//!
//! One dispatch thread drains a transport's receive queue and routes
//! each message by type: TP segments through the reassembler (completed
//! messages re-enter routing), requests to the RPC server (responses go
//! back out over the same transport), responses to the RPC client,
//! notifications to the event consumer. Handler slots are optional;
//! messages with no slot installed are counted and dropped.

use crate::config::TpConfig;
use crate::error::Error;
use crate::events::EventConsumer;
use crate::protocol::message::{Message, MessageType};
use crate::rpc::{RpcClient, RpcServer};
use crate::tp::reassembly::Reassembler;
use crate::tp::segment::segment_message;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often the dispatch thread sweeps stalled reassemblies.
const REASSEMBLY_SWEEP: Duration = Duration::from_millis(500);

/// Routes inbound messages of one transport to the protocol layers.
pub struct Dispatcher {
    transport: Arc<Transport>,
    tp: TpConfig,
    reassembler: Arc<Mutex<Reassembler>>,
    rpc_server: Mutex<Option<Arc<RpcServer>>>,
    rpc_client: Mutex<Option<Arc<RpcClient>>>,
    consumer: Mutex<Option<Arc<EventConsumer>>>,
    unrouted: AtomicU64,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(transport: Arc<Transport>, tp: TpConfig) -> Arc<Self> {
        let reassembler = Arc::new(Mutex::new(Reassembler::new(tp.clone())));
        Arc::new(Self {
            transport,
            tp,
            reassembler,
            rpc_server: Mutex::new(None),
            rpc_client: Mutex::new(None),
            consumer: Mutex::new(None),
            unrouted: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    /// Install the server slot (inbound requests).
    pub fn attach_server(&self, server: Arc<RpcServer>) {
        *self.rpc_server.lock() = Some(server);
    }

    /// Install the client slot (inbound responses).
    pub fn attach_client(&self, client: Arc<RpcClient>) {
        *self.rpc_client.lock() = Some(client);
    }

    /// Install the consumer slot (inbound notifications).
    pub fn attach_consumer(&self, consumer: Arc<EventConsumer>) {
        *self.consumer.lock() = Some(consumer);
    }

    /// Spawn the dispatch thread. Idempotent.
    pub fn start(self: &Arc<Self>) -> crate::error::Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::Relaxed);
        self.transport.start()?;

        let dispatcher = Arc::clone(self);
        *handle = Some(
            thread::Builder::new()
                .name("hsip-dispatch".to_string())
                .spawn(move || dispatcher.run())
                .map_err(Error::Network)?,
        );
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run(self: Arc<Self>) {
        let mut last_sweep = Instant::now();
        while !self.shutdown.load(Ordering::Relaxed) {
            if let Some((msg, from)) = self.transport.receive_timeout(Duration::from_millis(100))
            {
                self.dispatch_one(msg, from);
            }
            if last_sweep.elapsed() >= REASSEMBLY_SWEEP {
                last_sweep = Instant::now();
                let evicted = self.reassembler.lock().evict_expired();
                if evicted > 0 {
                    log::debug!("[dispatch] evicted {} stalled reassemblies", evicted);
                }
            }
        }
    }

    /// Route one message. Public so single-threaded tests can push
    /// messages through without the dispatch thread.
    pub fn dispatch_one(&self, msg: Message, from: SocketAddr) {
        // SD traffic rides its own transport; anything that leaks over
        // here is dropped.
        if msg.is_sd() {
            self.unrouted.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if msg.message_type.is_tp() {
            let completed = match self.reassembler.lock().insert(&msg) {
                Ok(completed) => completed,
                Err(e) => {
                    log::debug!("[dispatch] TP segment from {} rejected: {}", from, e);
                    return;
                }
            };
            if let Some(complete) = completed {
                self.dispatch_one(complete, from);
            }
            return;
        }

        match msg.message_type {
            MessageType::Request | MessageType::RequestNoReturn | MessageType::Unknown(_) => {
                let server = self.rpc_server.lock().clone();
                match server {
                    Some(server) => {
                        if let Some(response) = server.handle_request(&msg) {
                            self.send_out(&response, from);
                        }
                    }
                    None => {
                        self.unrouted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            MessageType::Response | MessageType::Error => {
                let client = self.rpc_client.lock().clone();
                match client {
                    Some(client) => client.handle_response(&msg),
                    None => {
                        self.unrouted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            MessageType::Notification => {
                let consumer = self.consumer.lock().clone();
                match consumer {
                    Some(consumer) => consumer.handle_notification(&msg),
                    None => {
                        self.unrouted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            _ => {
                self.unrouted.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[dispatch] no route for {:?} from {}",
                    msg.message_type,
                    from
                );
            }
        }
    }

    fn send_out(&self, msg: &Message, peer: SocketAddr) {
        let parts = match segment_message(msg, &self.tp) {
            Ok(parts) => parts,
            Err(e) => {
                log::debug!("[dispatch] response to {} not sendable: {}", peer, e);
                return;
            }
        };
        for part in parts {
            if let Err(e) = self.transport.send(&part, peer) {
                log::debug!("[dispatch] response to {} failed: {}", peer, e);
                return;
            }
        }
    }

    /// Messages that had no handler slot installed.
    pub fn unrouted_count(&self) -> u64 {
        self.unrouted.load(Ordering::Relaxed)
    }

    pub fn reassembly_pending(&self) -> usize {
        self.reassembler.lock().pending_count()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{MessageId, RequestId, ReturnCode};
    use std::net::{IpAddr, Ipv4Addr};

    fn setup() -> (Arc<Dispatcher>, Arc<Transport>) {
        let transport = Arc::new(
            Transport::udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap(),
        );
        transport.start().unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&transport), TpConfig::default());
        (dispatcher, transport)
    }

    fn from_addr() -> SocketAddr {
        "127.0.0.1:45555".parse().unwrap()
    }

    #[test]
    fn request_is_answered_over_transport() {
        let (dispatcher, transport) = setup();
        let server = Arc::new(RpcServer::new(0x1000, 0x01));
        server.register(0x0001, |payload| Ok(payload.to_vec()));
        dispatcher.attach_server(server);

        let request = Message::new(
            MessageId::new(0x1000, 0x0001),
            RequestId::new(0x0042, 0x0001),
            MessageType::Request,
            b"ping".to_vec(),
        );
        // Answer goes to our own transport so we can observe it.
        dispatcher.dispatch_one(request, transport.local_addr());

        let (response, _) = transport
            .receive_timeout(Duration::from_secs(2))
            .expect("response expected");
        assert_eq!(response.message_type, MessageType::Response);
        assert_eq!(response.return_code, ReturnCode::Ok);
        assert_eq!(response.payload, b"ping");
    }

    #[test]
    fn tp_segments_reassemble_then_route() {
        let (dispatcher, transport) = setup();
        let server = Arc::new(RpcServer::new(0x1000, 0x01));
        server.register(0x0001, |payload| Ok(vec![payload.len() as u8]));
        dispatcher.attach_server(server);

        let big = Message::new(
            MessageId::new(0x1000, 0x0001),
            RequestId::new(0x0042, 0x0002),
            MessageType::Request,
            vec![0x5A; 3000],
        );
        let segments = segment_message(&big, &TpConfig::default()).unwrap();
        for seg in segments {
            dispatcher.dispatch_one(seg, transport.local_addr());
        }

        let (response, _) = transport
            .receive_timeout(Duration::from_secs(2))
            .expect("response expected");
        assert_eq!(response.payload, vec![(3000 % 256) as u8]);
        assert_eq!(dispatcher.reassembly_pending(), 0);
    }

    #[test]
    fn notification_reaches_consumer() {
        let (dispatcher, _transport) = setup();
        let consumer = Arc::new(EventConsumer::new());
        let seen = Arc::new(AtomicU64::new(0));
        let seen_handler = Arc::clone(&seen);
        consumer.insert(
            0x8001,
            Arc::new(move |_, _| {
                seen_handler.fetch_add(1, Ordering::Relaxed);
            }),
        );
        dispatcher.attach_consumer(consumer);

        let notification = Message::new(
            MessageId::new(0x3000, 0x8001),
            RequestId::new(0, 1),
            MessageType::Notification,
            b"v".to_vec(),
        );
        dispatcher.dispatch_one(notification, from_addr());
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unrouted_messages_are_counted() {
        let (dispatcher, _transport) = setup();
        let notification = Message::new(
            MessageId::new(0x3000, 0x8001),
            RequestId::new(0, 1),
            MessageType::Notification,
            Vec::new(),
        );
        dispatcher.dispatch_one(notification, from_addr());

        let sd = crate::protocol::sd::SdPayload::new(vec![]).to_message(1);
        dispatcher.dispatch_one(sd, from_addr());

        assert_eq!(dispatcher.unrouted_count(), 2);
    }
}
