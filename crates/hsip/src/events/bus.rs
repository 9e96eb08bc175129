// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side event registry and fan-out.

use crate::config::{TpConfig, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use crate::protocol::message::{Message, MessageId, MessageType, RequestId, ReturnCode};
use crate::tp::segment::segment_message;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Publication policy of a registered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPolicy {
    /// Redistribute the latest value every cycle.
    Periodic(Duration),
    /// Send only when the payload differs from the previous one.
    OnChange,
    /// Send only on explicit publish calls.
    OnRequest,
    /// Send on every publish call, unconditionally.
    Triggered,
}

struct EventRecord {
    eventgroup_id: u16,
    policy: PublishPolicy,
    /// Fields retain their latest value for replay to new subscribers.
    is_field: bool,
    last_value: Option<Vec<u8>>,
    next_due: Instant,
}

struct SubscriberRecord {
    /// Prefix filter attached at subscribe time, if any.
    filter: Option<Vec<u8>>,
    ttl_deadline: Instant,
}

#[derive(Default)]
struct Registry {
    events: HashMap<u16, EventRecord>,
    /// Keyed by `(eventgroup_id, client endpoint)`.
    subscribers: HashMap<(u16, SocketAddr), SubscriberRecord>,
    /// Eventgroups distributed via multicast instead of unicast fan-out.
    multicast: HashMap<u16, SocketAddr>,
}

/// Event fan-out for one served service instance.
pub struct EventBus {
    service_id: u16,
    interface_version: u8,
    transport: Arc<Transport>,
    tp: TpConfig,
    registry: Arc<Mutex<Registry>>,
    /// Session counter stamped on outgoing notifications.
    session: AtomicU16,
    shutdown: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(
        service_id: u16,
        interface_version: u8,
        transport: Arc<Transport>,
        tp: TpConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            service_id,
            interface_version,
            transport,
            tp,
            registry: Arc::new(Mutex::new(Registry::default())),
            session: AtomicU16::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
        })
    }

    pub fn service_id(&self) -> u16 {
        self.service_id
    }

    /// Start the periodic publisher timer. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::Relaxed);
        let bus = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("hsip-event-timer".to_string())
            .spawn(move || bus.timer_loop())
            .map_err(Error::Network)?;
        *timer = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.timer.lock().take() {
            let _ = handle.join();
        }
    }

    /// Register an event under an eventgroup. Duplicate ids rejected.
    pub fn register_event(
        &self,
        event_id: u16,
        eventgroup_id: u16,
        policy: PublishPolicy,
    ) -> bool {
        self.insert_event(event_id, eventgroup_id, policy, false, None)
    }

    /// Register a field: an event whose latest value is retained and
    /// replayed to every new subscriber.
    pub fn register_field(
        &self,
        event_id: u16,
        eventgroup_id: u16,
        initial: Option<Vec<u8>>,
    ) -> bool {
        self.insert_event(event_id, eventgroup_id, PublishPolicy::OnChange, true, initial)
    }

    fn insert_event(
        &self,
        event_id: u16,
        eventgroup_id: u16,
        policy: PublishPolicy,
        is_field: bool,
        initial: Option<Vec<u8>>,
    ) -> bool {
        let mut registry = self.registry.lock();
        if registry.events.contains_key(&event_id) {
            return false;
        }
        registry.events.insert(
            event_id,
            EventRecord {
                eventgroup_id,
                policy,
                is_field,
                last_value: initial,
                next_due: Instant::now(),
            },
        );
        true
    }

    /// Serve `eventgroup_id` via multicast: publications go to `group`
    /// once instead of once per subscriber, and the SD engine attaches
    /// the group to its SUBSCRIBE acks.
    pub fn set_eventgroup_multicast(&self, eventgroup_id: u16, group: SocketAddr) {
        self.registry.lock().multicast.insert(eventgroup_id, group);
    }

    /// Multicast group serving `eventgroup_id`, if one is configured.
    pub fn eventgroup_multicast(&self, eventgroup_id: u16) -> Option<SocketAddr> {
        self.registry.lock().multicast.get(&eventgroup_id).copied()
    }

    /// Whether any registered event belongs to `eventgroup_id`; the SD
    /// engine acks or nacks subscriptions based on this.
    pub fn has_eventgroup(&self, eventgroup_id: u16) -> bool {
        self.registry
            .lock()
            .events
            .values()
            .any(|e| e.eventgroup_id == eventgroup_id)
    }

    /// Attach a subscriber to an eventgroup. Returns false when no
    /// event belongs to the group (the caller answers with a NACK).
    /// Field values of the group are replayed to the new subscriber.
    pub fn add_subscriber(
        &self,
        eventgroup_id: u16,
        client: SocketAddr,
        filter: Option<Vec<u8>>,
        ttl: Duration,
    ) -> bool {
        let replay: Vec<(u16, Vec<u8>)>;
        {
            let mut registry = self.registry.lock();
            if !registry
                .events
                .values()
                .any(|e| e.eventgroup_id == eventgroup_id)
            {
                return false;
            }
            registry.subscribers.insert(
                (eventgroup_id, client),
                SubscriberRecord {
                    filter: filter.clone(),
                    ttl_deadline: Instant::now() + ttl,
                },
            );
            replay = registry
                .events
                .iter()
                .filter(|(_, e)| {
                    e.eventgroup_id == eventgroup_id && e.is_field && e.last_value.is_some()
                })
                .map(|(id, e)| {
                    let value = e.last_value.clone().unwrap_or_default();
                    (*id, value)
                })
                .collect();
        }

        log::debug!(
            "[events] subscriber {} attached to group 0x{:04x}",
            client,
            eventgroup_id
        );
        for (event_id, value) in replay {
            if admitted(&filter, &value) {
                if let Err(e) = self.send_notification(event_id, &value, client) {
                    log::debug!("[events] field replay to {} failed: {}", client, e);
                }
            }
        }
        true
    }

    /// Detach a subscriber (unsubscribe or TTL expiry on the SD side).
    pub fn remove_subscriber(&self, eventgroup_id: u16, client: SocketAddr) {
        self.registry
            .lock()
            .subscribers
            .remove(&(eventgroup_id, client));
    }

    /// Drop subscriptions whose TTL deadline passed.
    pub fn reap_expired(&self) -> usize {
        let mut registry = self.registry.lock();
        let before = registry.subscribers.len();
        let now = Instant::now();
        registry.subscribers.retain(|(group, client), record| {
            let live = record.ttl_deadline > now;
            if !live {
                log::debug!(
                    "[events] subscription ({:#06x}, {}) expired",
                    group,
                    client
                );
            }
            live
        });
        before - registry.subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().subscribers.len()
    }

    /// Publish a value for `event_id`.
    ///
    /// Returns how many subscribers the notification went to. OnChange
    /// events (and fields) skip distribution when the value is
    /// unchanged; every policy retains the value where its contract
    /// needs it.
    pub fn publish(&self, event_id: u16, data: &[u8]) -> Result<usize> {
        let targets: Vec<SocketAddr>;
        {
            let mut registry = self.registry.lock();
            let Registry {
                events,
                subscribers,
                multicast,
            } = &mut *registry;
            let record = events
                .get_mut(&event_id)
                .ok_or(Error::State("event not registered"))?;

            let unchanged = record.last_value.as_deref() == Some(data);
            let suppress = match record.policy {
                PublishPolicy::OnChange => unchanged,
                _ => false,
            };
            record.last_value = Some(data.to_vec());
            if suppress {
                return Ok(0);
            }

            let unicast = matching_subscribers(subscribers, record.eventgroup_id, data);
            // A multicast-served group gets one send for all subscribers.
            targets = match multicast.get(&record.eventgroup_id) {
                Some(group) if !unicast.is_empty() => vec![*group],
                _ => unicast,
            };
        }

        for client in &targets {
            self.send_notification(event_id, data, *client)?;
        }
        Ok(targets.len())
    }

    fn send_notification(&self, event_id: u16, data: &[u8], client: SocketAddr) -> Result<()> {
        // Session counter wraps past 0 like any live session id.
        let session = loop {
            let next = self.session.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if next != 0 {
                break next;
            }
        };
        let msg = Message {
            message_id: MessageId::new(self.service_id, event_id),
            request_id: RequestId::new(0x0000, session),
            protocol_version: PROTOCOL_VERSION,
            interface_version: self.interface_version,
            message_type: MessageType::Notification,
            return_code: ReturnCode::Ok,
            payload: data.to_vec(),
        };
        for part in segment_message(&msg, &self.tp)? {
            self.transport.send(&part, client)?;
        }
        Ok(())
    }

    /// Periodic publisher: redistributes the latest value of periodic
    /// events. Overruns skip ticks instead of queueing.
    fn timer_loop(self: Arc<Self>) {
        const TICK: Duration = Duration::from_millis(20);
        while !self.shutdown.load(Ordering::Relaxed) {
            thread::sleep(TICK);
            let now = Instant::now();

            let mut due: Vec<(u16, Vec<u8>, Vec<SocketAddr>)> = Vec::new();
            {
                let mut registry = self.registry.lock();
                let Registry {
                    events,
                    subscribers,
                    multicast,
                } = &mut *registry;
                for (id, record) in events.iter_mut() {
                    let PublishPolicy::Periodic(cycle) = record.policy else {
                        continue;
                    };
                    if record.next_due > now {
                        continue;
                    }
                    // Skip missed ticks: schedule from now, not from the
                    // missed deadline.
                    record.next_due = now + cycle;
                    if let Some(value) = record.last_value.clone() {
                        let unicast =
                            matching_subscribers(subscribers, record.eventgroup_id, &value);
                        let targets = match multicast.get(&record.eventgroup_id) {
                            Some(group) if !unicast.is_empty() => vec![*group],
                            _ => unicast,
                        };
                        if !targets.is_empty() {
                            due.push((*id, value, targets));
                        }
                    }
                }
            }

            for (event_id, value, targets) in due {
                for client in targets {
                    if let Err(e) = self.send_notification(event_id, &value, client) {
                        log::debug!("[events] periodic send to {} failed: {}", client, e);
                    }
                }
            }
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.timer.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Subscribers of `eventgroup_id` whose filter admits `data`.
fn matching_subscribers(
    subscribers: &HashMap<(u16, SocketAddr), SubscriberRecord>,
    eventgroup_id: u16,
    data: &[u8],
) -> Vec<SocketAddr> {
    subscribers
        .iter()
        .filter(|((group, _), record)| {
            *group == eventgroup_id && admitted(&record.filter, data)
        })
        .map(|((_, client), _)| *client)
        .collect()
}

/// Filter rule: prefix equality of the payload.
fn admitted(filter: &Option<Vec<u8>>, data: &[u8]) -> bool {
    match filter {
        Some(prefix) => data.starts_with(prefix),
        None => true,
    }
}
