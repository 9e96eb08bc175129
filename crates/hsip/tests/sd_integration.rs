// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery end to end over loopback: two SD engines cross-wired over
//! unicast UDP (each engine's "group" address is the other's socket),
//! which exercises the full offer/find/subscribe exchange without
//! depending on multicast routing in the test environment.

use hsip::config::{SdConfig, TpConfig};
use hsip::dispatch::Dispatcher;
use hsip::events::{EventBus, EventConsumer, PublishPolicy, SubscriptionState};
use hsip::protocol::sd::SdEndpoint;
use hsip::sd::{OfferedService, SdEngine, ANY_INSTANCE};
use hsip::transport::Transport;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn transport() -> Arc<Transport> {
    let t = Arc::new(Transport::udp("127.0.0.1:0".parse::<SocketAddr>().unwrap()).unwrap());
    t.start().unwrap();
    t
}

fn sd_config(peer: SocketAddr) -> SdConfig {
    SdConfig {
        multicast_group: Ipv4Addr::LOCALHOST,
        multicast_port: peer.port(),
        initial_delay: Duration::from_millis(100),
        repetition_base: Duration::from_millis(200),
        repetition_max_count: 2,
        cyclic_offer_delay: Duration::from_secs(1),
        default_ttl: 5,
        response_delay_max: Duration::from_millis(1500),
        ..SdConfig::default()
    }
}

/// Two engines, each sending its "group" traffic to the other.
fn engines() -> (Arc<SdEngine>, Arc<SdEngine>) {
    let ta = transport();
    let tb = transport();
    let addr_a = ta.local_addr();
    let addr_b = tb.local_addr();
    let a = SdEngine::new(sd_config(addr_b), ta);
    let b = SdEngine::new(sd_config(addr_a), tb);
    a.start().unwrap();
    b.start().unwrap();
    (a, b)
}

#[test]
fn offer_reaches_finder_within_window() {
    let (offerer, finder) = engines();

    offerer
        .offer_service(OfferedService {
            service_id: 0x1000,
            instance_id: 0x0001,
            major_version: 1,
            minor_version: 0,
            endpoint: SdEndpoint::udp(Ipv4Addr::LOCALHOST, 30509),
        })
        .unwrap();

    // Find fired shortly after the offerer starts its schedule.
    std::thread::sleep(Duration::from_millis(50));
    let result = Arc::new(Mutex::new(None));
    let result_sink = Arc::clone(&result);
    let asked = Instant::now();
    finder
        .find_service(
            0x1000,
            ANY_INSTANCE,
            Box::new(move |instances| {
                *result_sink.lock().unwrap() = Some(instances);
            }),
        )
        .unwrap();

    let deadline = Instant::now() + Duration::from_millis(500);
    loop {
        if let Some(instances) = result.lock().unwrap().take() {
            assert!(!instances.is_empty(), "find reported no instances");
            assert_eq!(instances[0].service_id, 0x1000);
            assert_eq!(instances[0].endpoint.port, 30509);
            break;
        }
        assert!(
            Instant::now() < deadline,
            "find not answered within 500 ms of t={:?}",
            asked.elapsed()
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    offerer.shutdown();
    finder.shutdown();
}

#[test]
fn stop_offer_fires_unavailable_on_peer() {
    let (offerer, watcher) = engines();

    let downs = Arc::new(AtomicU32::new(0));
    let ups = Arc::new(AtomicU32::new(0));
    let downs_handler = Arc::clone(&downs);
    let ups_handler = Arc::clone(&ups);
    watcher.set_availability_handler(Arc::new(move |_, up| {
        if up {
            ups_handler.fetch_add(1, Ordering::Relaxed);
        } else {
            downs_handler.fetch_add(1, Ordering::Relaxed);
        }
    }));

    offerer
        .offer_service(OfferedService {
            service_id: 0x2000,
            instance_id: 0x0001,
            major_version: 1,
            minor_version: 0,
            endpoint: SdEndpoint::udp(Ipv4Addr::LOCALHOST, 30510),
        })
        .unwrap();

    wait_until(Duration::from_secs(2), || ups.load(Ordering::Relaxed) >= 1);
    offerer.stop_offer(0x2000, 0x0001).unwrap();
    wait_until(Duration::from_secs(2), || downs.load(Ordering::Relaxed) >= 1);

    assert!(watcher.known_instances().is_empty());
    offerer.shutdown();
    watcher.shutdown();
}

#[test]
fn subscribe_notify_delivers_periodic_floats() {
    let (server_sd, client_sd) = engines();

    // Server side: event bus over its own unicast transport.
    let event_tx = transport();
    let bus = EventBus::new(0x3000, 0x01, Arc::clone(&event_tx), TpConfig::default());
    bus.register_event(
        0x8001,
        0x0001,
        PublishPolicy::Periodic(Duration::from_millis(200)),
    );
    bus.start().unwrap();
    server_sd.attach_event_bus(Arc::clone(&bus));

    // Client side: notification receiver + consumer.
    let event_rx = transport();
    let consumer = Arc::new(EventConsumer::new());
    let values = Arc::new(Mutex::new(Vec::new()));
    let values_sink = Arc::clone(&values);
    consumer.insert(
        0x8001,
        Arc::new(move |_, payload| {
            if payload.len() == 4 {
                let bits = [payload[0], payload[1], payload[2], payload[3]];
                values_sink.lock().unwrap().push(f32::from_be_bytes(bits));
            }
        }),
    );
    let rx_dispatch = Dispatcher::new(Arc::clone(&event_rx), TpConfig::default());
    rx_dispatch.attach_consumer(Arc::clone(&consumer));
    rx_dispatch.start().unwrap();

    // Subscribe via SD; track the state transitions.
    let states = Arc::new(Mutex::new(Vec::new()));
    let states_sink = Arc::clone(&states);
    let rx_port = event_rx.local_addr().port();
    client_sd
        .subscribe_eventgroup(
            0x3000,
            0x0001,
            0x0001,
            SdEndpoint::udp(Ipv4Addr::LOCALHOST, rx_port),
            Arc::new(move |state| states_sink.lock().unwrap().push(state)),
        )
        .unwrap();

    wait_until(Duration::from_secs(2), || {
        client_sd.subscription_state(0x3000, 0x0001, 0x0001)
            == Some(SubscriptionState::Subscribed)
    });
    assert_eq!(
        states.lock().unwrap().first(),
        Some(&SubscriptionState::Subscribed)
    );
    assert_eq!(bus.subscriber_count(), 1);

    // Publish a sequence; the periodic timer redistributes the latest
    // value every 200 ms.
    bus.publish(0x8001, &1.25f32.to_be_bytes()).unwrap();
    let collected_enough = wait_until(Duration::from_secs(2), || {
        values.lock().unwrap().len() >= 4
    });
    assert!(collected_enough, "expected at least 4 notifications");
    assert!(values.lock().unwrap().iter().all(|v| *v == 1.25));

    bus.stop();
    rx_dispatch.stop();
    server_sd.shutdown();
    client_sd.shutdown();
}

#[test]
fn subscribe_unknown_group_is_rejected() {
    let (server_sd, client_sd) = engines();
    let bus = EventBus::new(0x3000, 0x01, transport(), TpConfig::default());
    server_sd.attach_event_bus(bus);

    client_sd
        .subscribe_eventgroup(
            0x3000,
            0x0001,
            0x0BAD,
            SdEndpoint::udp(Ipv4Addr::LOCALHOST, 49152),
            Arc::new(|_| {}),
        )
        .unwrap();

    let rejected = wait_until(Duration::from_secs(2), || {
        client_sd.subscription_state(0x3000, 0x0001, 0x0BAD)
            == Some(SubscriptionState::Rejected)
    });
    assert!(rejected, "subscription should be nacked");

    server_sd.shutdown();
    client_sd.shutdown();
}

/// Poll `predicate` until it holds or the timeout passes.
fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}
