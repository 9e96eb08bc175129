// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end RPC over loopback UDP: a served method, a calculator,
//! fire-and-forget, and deadline behavior against silent/partial
//! servers.

use hsip::config::{RpcConfig, TpConfig};
use hsip::dispatch::Dispatcher;
use hsip::rpc::{RpcClient, RpcError, RpcServer};
use hsip::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct TestNode {
    transport: Arc<Transport>,
    dispatcher: Arc<Dispatcher>,
}

impl TestNode {
    fn new() -> Self {
        let transport = Arc::new(
            Transport::udp("127.0.0.1:0".parse::<SocketAddr>().unwrap()).unwrap(),
        );
        let dispatcher = Dispatcher::new(Arc::clone(&transport), TpConfig::default());
        dispatcher.start().unwrap();
        Self {
            transport,
            dispatcher,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }
}

fn client_for(node: &TestNode, server: SocketAddr, response_timeout: Duration) -> Arc<RpcClient> {
    let cfg = RpcConfig::default().with_response_timeout(response_timeout);
    let client = Arc::new(
        RpcClient::new(
            0x1234,
            Arc::clone(&node.transport),
            server,
            cfg,
            TpConfig::default(),
        )
        .unwrap(),
    );
    node.dispatcher.attach_client(Arc::clone(&client));
    client
}

#[test]
fn hello_world_round_trip() {
    let server_node = TestNode::new();
    let client_node = TestNode::new();

    let server = Arc::new(RpcServer::new(0x1000, 0x01));
    server.register(0x0001, |params| {
        let mut reply = b"Hello World! Server received: ".to_vec();
        reply.extend_from_slice(params);
        Ok(reply)
    });
    server_node.dispatcher.attach_server(server);

    let client = client_for(&client_node, server_node.addr(), Duration::from_secs(5));
    let outcome = client.call_sync(0x1000, 0x0001, b"Hello from Client!", None);

    let payload = outcome.expect("call should succeed");
    assert_eq!(payload.len(), 48);
    assert_eq!(payload, b"Hello World! Server received: Hello from Client!");
}

#[test]
fn calculator_add_and_multiply() {
    let server_node = TestNode::new();
    let client_node = TestNode::new();

    let server = Arc::new(RpcServer::new(0x2000, 0x01));
    server.register(0x0001, |params| {
        if params.len() != 8 {
            return Err(RpcError::InvalidParameters);
        }
        let a = i32::from_be_bytes([params[0], params[1], params[2], params[3]]);
        let b = i32::from_be_bytes([params[4], params[5], params[6], params[7]]);
        Ok((a + b).to_be_bytes().to_vec())
    });
    server.register(0x0002, |params| {
        if params.len() != 8 {
            return Err(RpcError::InvalidParameters);
        }
        let a = i32::from_be_bytes([params[0], params[1], params[2], params[3]]);
        let b = i32::from_be_bytes([params[4], params[5], params[6], params[7]]);
        Ok((a * b).to_be_bytes().to_vec())
    });
    server_node.dispatcher.attach_server(server);

    let client = client_for(&client_node, server_node.addr(), Duration::from_secs(5));

    let mut params = 10i32.to_be_bytes().to_vec();
    params.extend_from_slice(&5i32.to_be_bytes());
    let sum = client.call_sync(0x2000, 0x0001, &params, None).unwrap();
    assert_eq!(sum, 15i32.to_be_bytes());

    let mut params = 6i32.to_be_bytes().to_vec();
    params.extend_from_slice(&7i32.to_be_bytes());
    let product = client.call_sync(0x2000, 0x0002, &params, None).unwrap();
    assert_eq!(product, 42i32.to_be_bytes());
}

#[test]
fn unregistered_method_times_out_or_reports_not_found() {
    let server_node = TestNode::new();
    let client_node = TestNode::new();

    // A live server with no matching method registered.
    let server = Arc::new(RpcServer::new(0x1000, 0x01));
    server_node.dispatcher.attach_server(server);

    let client = client_for(&client_node, server_node.addr(), Duration::from_millis(100));
    let started = Instant::now();
    let outcome = client.call_sync(0x1000, 0x00EE, b"", None);
    let elapsed = started.elapsed();

    assert!(
        matches!(outcome, Err(RpcError::MethodNotFound) | Err(RpcError::Timeout)),
        "unexpected outcome {:?}",
        outcome
    );
    assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
}

#[test]
fn silent_server_call_times_out() {
    let client_node = TestNode::new();
    // Nothing listens on this address's dispatcher side.
    let silent = TestNode::new();

    let client = client_for(&client_node, silent.addr(), Duration::from_millis(100));
    let outcome = client.call_sync(0x1000, 0x0001, b"", None);
    assert_eq!(outcome, Err(RpcError::Timeout));
}

#[test]
fn handler_error_propagates_as_typed_failure() {
    let server_node = TestNode::new();
    let client_node = TestNode::new();

    let server = Arc::new(RpcServer::new(0x1000, 0x01));
    server.register(0x0001, |_| Err(RpcError::InvalidParameters));
    server_node.dispatcher.attach_server(server);

    let client = client_for(&client_node, server_node.addr(), Duration::from_secs(5));
    let outcome = client.call_sync(0x1000, 0x0001, b"bad", None);
    assert_eq!(outcome, Err(RpcError::InvalidParameters));
}

#[test]
fn concurrent_calls_correlate_by_session() {
    let server_node = TestNode::new();
    let client_node = TestNode::new();

    let server = Arc::new(RpcServer::new(0x1000, 0x01));
    server.register(0x0001, |params| Ok(params.to_vec()));
    server_node.dispatcher.attach_server(server);

    let client = client_for(&client_node, server_node.addr(), Duration::from_secs(5));

    let mut workers = Vec::new();
    for i in 0..8u8 {
        let client = Arc::clone(&client);
        workers.push(std::thread::spawn(move || {
            let payload = vec![i; 16];
            let out = client.call_sync(0x1000, 0x0001, &payload, None).unwrap();
            assert_eq!(out, payload);
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(client.pending_count(), 0);
}

#[test]
fn fire_and_forget_reaches_handler() {
    use hsip::protocol::message::{Message, MessageId, MessageType, RequestId};

    let server_node = TestNode::new();
    let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let hits_handler = Arc::clone(&hits);

    let server = Arc::new(RpcServer::new(0x1000, 0x01));
    server.register(0x0009, move |_| {
        hits_handler.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(Vec::new())
    });
    server_node.dispatcher.attach_server(server);

    let sender = TestNode::new();
    let msg = Message::new(
        MessageId::new(0x1000, 0x0009),
        RequestId::new(0x0042, 0x0001),
        MessageType::RequestNoReturn,
        b"notify".to_vec(),
    );
    sender.transport.send(&msg, server_node.addr()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while hits.load(std::sync::atomic::Ordering::Relaxed) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(hits.load(std::sync::atomic::Ordering::Relaxed), 1);
    // No response came back to the sender.
    assert!(sender.transport.receive_timeout(Duration::from_millis(200)).is_none());
}
