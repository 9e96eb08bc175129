// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The SD engine: offer schedules, find windows, eventgroup
//! subscription negotiation, TTL reaping, reboot detection.
//!
//! Two background threads per engine: a receive loop draining the
//! multicast transport and a 50 ms timer driving schedules, find
//! windows, subscription refresh and the TTL reaper. All callbacks run
//! outside the state lock.

use crate::config::SdConfig;
use crate::error::{Error, Result};
use crate::events::{refresh_after, EventBus, SubscriptionState};
use crate::protocol::message::Message;
use crate::protocol::sd::{
    EventgroupEntry, SdEndpoint, SdEntry, SdOption, SdPayload, ServiceEntry,
};
use crate::sd::schedule::OfferSchedule;
use crate::sd::{
    AvailabilityHandler, FindCallback, OfferedService, ServiceInstance, StatusHandler,
    ANY_INSTANCE,
};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Timer granularity for schedules, find windows and the reaper.
const TICK: Duration = Duration::from_millis(50);

/// Error counters, incremented where messages are dropped silently.
#[derive(Debug, Default)]
pub struct SdStats {
    dropped_messages: AtomicU64,
    offers_sent: AtomicU64,
    acks_sent: AtomicU64,
    nacks_sent: AtomicU64,
}

impl SdStats {
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn offers_sent(&self) -> u64 {
        self.offers_sent.load(Ordering::Relaxed)
    }

    pub fn acks_sent(&self) -> u64 {
        self.acks_sent.load(Ordering::Relaxed)
    }

    pub fn nacks_sent(&self) -> u64 {
        self.nacks_sent.load(Ordering::Relaxed)
    }
}

struct OfferedEntry {
    service: OfferedService,
    schedule: OfferSchedule,
}

struct RemoteOffer {
    instance: ServiceInstance,
    deadline: Instant,
    /// SD source of the offer; subscribes go back there.
    sd_peer: SocketAddr,
}

struct FindRequest {
    service_id: u16,
    instance_id: u16,
    deadline: Instant,
    callback: Option<FindCallback>,
}

struct ClientSubscription {
    endpoint: SdEndpoint,
    state: SubscriptionState,
    ttl_deadline: Instant,
    refresh_due: Instant,
    counter: u8,
    on_status: StatusHandler,
}

#[derive(Default)]
struct EngineState {
    offered: HashMap<(u16, u16), OfferedEntry>,
    remote: HashMap<(u16, u16), RemoteOffer>,
    finds: Vec<FindRequest>,
    /// Keyed by `(service_id, instance_id, eventgroup_id)`.
    subscriptions: HashMap<(u16, u16, u16), ClientSubscription>,
    /// Peers we have heard from, for reboot detection.
    peers_seen: HashMap<IpAddr, bool>,
}

/// Service Discovery engine bound to one multicast transport.
pub struct SdEngine {
    cfg: SdConfig,
    transport: Arc<Transport>,
    state: Mutex<EngineState>,
    /// SD message session counter; wraps past 0.
    session: AtomicU16,
    /// Cleared after the first SD message; drives the reboot flag.
    first_message_pending: AtomicBool,
    event_bus: Mutex<Option<Arc<EventBus>>>,
    availability: Mutex<Option<AvailabilityHandler>>,
    stats: SdStats,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SdEngine {
    /// Create an engine over an already-bound multicast transport.
    pub fn new(cfg: SdConfig, transport: Arc<Transport>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            transport,
            state: Mutex::new(EngineState::default()),
            session: AtomicU16::new(0),
            first_message_pending: AtomicBool::new(true),
            event_bus: Mutex::new(None),
            availability: Mutex::new(None),
            stats: SdStats::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Start the receive loop and the timer thread. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }
        self.shutdown.store(false, Ordering::Relaxed);
        self.transport.start()?;

        let engine = Arc::clone(self);
        threads.push(
            thread::Builder::new()
                .name("hsip-sd-rx".to_string())
                .spawn(move || engine.receive_loop())
                .map_err(Error::Network)?,
        );

        let engine = Arc::clone(self);
        threads.push(
            thread::Builder::new()
                .name("hsip-sd-timer".to_string())
                .spawn(move || engine.timer_loop())
                .map_err(Error::Network)?,
        );
        log::debug!("[SD] engine started (group {})", self.group_addr());
        Ok(())
    }

    /// Stop both threads; no timer callback runs after return.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }

    /// Attach the served event bus; SUBSCRIBE handling consults it.
    pub fn attach_event_bus(&self, bus: Arc<EventBus>) {
        *self.event_bus.lock() = Some(bus);
    }

    /// Install the offer/stop-offer observer. The bool is true for
    /// available, false for unavailable.
    pub fn set_availability_handler(&self, handler: AvailabilityHandler) {
        *self.availability.lock() = Some(handler);
    }

    pub fn stats(&self) -> &SdStats {
        &self.stats
    }

    // ===== Server side =====

    /// Offer a service. Re-offering with identical parameters is
    /// idempotent; changed parameters restart the announcement
    /// schedule.
    pub fn offer_service(&self, service: OfferedService) -> Result<()> {
        let key = (service.service_id, service.instance_id);
        let mut state = self.state.lock();
        if let Some(existing) = state.offered.get(&key) {
            if existing.service == service && !existing.schedule.is_stopped() {
                log::debug!(
                    "[SD] offer 0x{:04x}/0x{:04x} unchanged, keeping schedule",
                    key.0,
                    key.1
                );
                return Ok(());
            }
        }
        log::debug!("[SD] offering 0x{:04x}/0x{:04x}", key.0, key.1);
        state.offered.insert(
            key,
            OfferedEntry {
                service,
                schedule: OfferSchedule::new(&self.cfg, Instant::now()),
            },
        );
        Ok(())
    }

    /// Withdraw an offer: one STOP_OFFER (ttl = 0) goes out.
    pub fn stop_offer(&self, service_id: u16, instance_id: u16) -> Result<()> {
        let removed = self.state.lock().offered.remove(&(service_id, instance_id));
        match removed {
            Some(entry) => {
                log::debug!("[SD] stop offer 0x{:04x}/0x{:04x}", service_id, instance_id);
                let stop = self.offer_entry(&entry.service, 0);
                self.send_sd(vec![stop], self.group_addr())
            }
            None => Err(Error::State("service was not offered")),
        }
    }

    // ===== Client side =====

    /// Find instances of a service.
    ///
    /// The callback fires as soon as a matching offer is known (cached
    /// or freshly received), or with the empty list once
    /// `response_delay_max` elapses without one.
    pub fn find_service(
        &self,
        service_id: u16,
        instance_id: u16,
        callback: FindCallback,
    ) -> Result<()> {
        let cached = {
            let mut state = self.state.lock();
            let cached: Vec<ServiceInstance> = state
                .remote
                .values()
                .filter(|offer| {
                    offer.instance.service_id == service_id
                        && (instance_id == ANY_INSTANCE
                            || offer.instance.instance_id == instance_id)
                })
                .map(|offer| offer.instance.clone())
                .collect();
            if cached.is_empty() {
                // Register before sending so an answer racing the FIND
                // still lands in the collector.
                state.finds.push(FindRequest {
                    service_id,
                    instance_id,
                    deadline: Instant::now() + self.cfg.response_delay_max,
                    callback: Some(callback),
                });
                None
            } else {
                Some((callback, cached))
            }
        };
        if let Some((callback, cached)) = cached {
            callback(cached);
            return Ok(());
        }
        self.send_sd(vec![SdEntry::find(service_id, instance_id)], self.group_addr())
    }

    /// Subscribe to an eventgroup of a discovered service.
    ///
    /// `endpoint` is where this client receives notifications. State
    /// changes (ACK, NACK, TTL expiry) reach `on_status`.
    pub fn subscribe_eventgroup(
        &self,
        service_id: u16,
        instance_id: u16,
        eventgroup_id: u16,
        endpoint: SdEndpoint,
        on_status: StatusHandler,
    ) -> Result<()> {
        let key = (service_id, instance_id, eventgroup_id);
        let dest = self.peer_for(service_id, instance_id);
        {
            let mut state = self.state.lock();
            state.subscriptions.insert(
                key,
                ClientSubscription {
                    endpoint,
                    state: SubscriptionState::Requested,
                    ttl_deadline: Instant::now() + self.ttl_duration(),
                    refresh_due: Instant::now() + refresh_after(self.ttl_duration()),
                    counter: 0,
                    on_status,
                },
            );
        }
        self.send_subscribe(service_id, instance_id, eventgroup_id, endpoint, 0, dest)
    }

    /// Drop a subscription; the server sees a TTL-0 SUBSCRIBE.
    pub fn unsubscribe(
        &self,
        service_id: u16,
        instance_id: u16,
        eventgroup_id: u16,
    ) -> Result<()> {
        let key = (service_id, instance_id, eventgroup_id);
        let removed = self.state.lock().subscriptions.remove(&key);
        match removed {
            Some(sub) => {
                let dest = self.peer_for(service_id, instance_id);
                let entry = SdEntry::SubscribeEventgroup(EventgroupEntry {
                    service_id,
                    instance_id,
                    major_version: 0xFF,
                    eventgroup_id,
                    ttl: 0,
                    counter: sub.counter,
                    options: vec![SdOption::Ipv4Endpoint(sub.endpoint)],
                });
                self.send_sd(vec![entry], dest)
            }
            None => Err(Error::State("not subscribed")),
        }
    }

    pub fn subscription_state(
        &self,
        service_id: u16,
        instance_id: u16,
        eventgroup_id: u16,
    ) -> Option<SubscriptionState> {
        self.state
            .lock()
            .subscriptions
            .get(&(service_id, instance_id, eventgroup_id))
            .map(|s| s.state)
    }

    pub fn known_instances(&self) -> Vec<ServiceInstance> {
        self.state
            .lock()
            .remote
            .values()
            .map(|o| o.instance.clone())
            .collect()
    }

    // ===== Inbound processing =====

    /// Process one inbound SD message. Invalid messages are counted
    /// and dropped; they never fail the engine.
    pub fn handle_message(&self, msg: &Message, from: SocketAddr) {
        let payload = match SdPayload::from_message(msg) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
                log::debug!("[SD] dropping invalid SD message from {}: {}", from, e);
                return;
            }
        };

        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();
            self.detect_reboot(&mut state, &payload, from, &mut actions);
            for entry in &payload.entries {
                match entry {
                    SdEntry::OfferService(e) if e.ttl > 0 => {
                        self.on_offer(&mut state, e, from, &mut actions);
                    }
                    SdEntry::OfferService(e) => {
                        self.on_stop_offer(&mut state, e, &mut actions);
                    }
                    SdEntry::FindService(e) => {
                        self.on_find(&state, e, from, &mut actions);
                    }
                    SdEntry::SubscribeEventgroup(e) => {
                        actions.subscribes.push((e.clone(), from));
                    }
                    SdEntry::SubscribeEventgroupAck(e) => {
                        self.on_subscribe_ack(&mut state, e, &mut actions);
                    }
                }
            }
        }
        self.run_actions(actions);
    }

    /// Timer body: offer schedules, find windows, refreshes, reaping.
    /// Public so tests can drive time without the thread.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut actions = Actions::default();
        {
            let mut state = self.state.lock();

            // Offer schedules due this tick are batched into one message.
            let mut offers = Vec::new();
            for entry in state.offered.values_mut() {
                if entry.schedule.poll(now) {
                    offers.push(self.offer_entry(&entry.service, self.cfg.default_ttl));
                }
            }
            if !offers.is_empty() {
                actions.sends.push((offers, self.group_addr()));
            }

            // Find windows that closed without a match report empty.
            let mut open = Vec::new();
            for mut find in state.finds.drain(..) {
                if find.deadline <= now {
                    if let Some(callback) = find.callback.take() {
                        actions.find_results.push((callback, Vec::new()));
                    }
                } else {
                    open.push(find);
                }
            }
            state.finds = open;

            // TTL reaper over remote offers.
            let expired: Vec<(u16, u16)> = state
                .remote
                .iter()
                .filter(|(_, offer)| offer.deadline <= now)
                .map(|(key, _)| *key)
                .collect();
            for key in expired {
                if let Some(offer) = state.remote.remove(&key) {
                    log::debug!("[SD] offer 0x{:04x}/0x{:04x} expired", key.0, key.1);
                    actions.unavailable.push(offer.instance);
                }
            }

            // Subscription refresh and expiry.
            for (key, sub) in state.subscriptions.iter_mut() {
                match sub.state {
                    SubscriptionState::Subscribed if sub.ttl_deadline <= now => {
                        sub.state = SubscriptionState::Expired;
                        actions
                            .status_changes
                            .push((Arc::clone(&sub.on_status), SubscriptionState::Expired));
                    }
                    SubscriptionState::Subscribed if sub.refresh_due <= now => {
                        sub.state = SubscriptionState::PendingAck;
                        sub.counter = sub.counter.wrapping_add(1) & 0x0F;
                        sub.refresh_due = now + refresh_after(self.ttl_duration());
                        actions.refreshes.push((*key, sub.endpoint, sub.counter));
                    }
                    _ => {}
                }
            }
        }
        self.run_actions(actions);

        if let Some(bus) = self.event_bus.lock().clone() {
            bus.reap_expired();
        }
    }

    // ===== Entry handlers (called with the state lock held) =====

    fn detect_reboot(
        &self,
        state: &mut EngineState,
        payload: &SdPayload,
        from: SocketAddr,
        actions: &mut Actions,
    ) {
        let seen_before = state.peers_seen.insert(from.ip(), true).is_some();
        if seen_before && payload.reboot {
            // The peer restarted: every offer cached from it is stale.
            let stale: Vec<(u16, u16)> = state
                .remote
                .iter()
                .filter(|(_, offer)| offer.sd_peer.ip() == from.ip())
                .map(|(key, _)| *key)
                .collect();
            if !stale.is_empty() {
                log::debug!(
                    "[SD] peer {} rebooted, invalidating {} cached offers",
                    from.ip(),
                    stale.len()
                );
            }
            for key in stale {
                if let Some(offer) = state.remote.remove(&key) {
                    actions.unavailable.push(offer.instance);
                }
            }
        }
    }

    fn on_offer(
        &self,
        state: &mut EngineState,
        entry: &ServiceEntry,
        from: SocketAddr,
        actions: &mut Actions,
    ) {
        let key = (entry.service_id, entry.instance_id);
        // Our own offers loop back via the multicast group.
        if state.offered.contains_key(&key) {
            return;
        }

        let endpoint = SdOption::first_endpoint(&entry.options).unwrap_or_else(|| {
            let addr = match from.ip() {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            SdEndpoint::udp(addr, crate::config::DEFAULT_SERVICE_PORT)
        });
        let instance = ServiceInstance {
            service_id: entry.service_id,
            instance_id: entry.instance_id,
            major_version: entry.major_version,
            minor_version: entry.minor_version,
            endpoint,
            ttl: entry.ttl,
        };

        let deadline = Instant::now() + Duration::from_secs(u64::from(entry.ttl));
        let is_new = state
            .remote
            .insert(
                key,
                RemoteOffer {
                    instance: instance.clone(),
                    deadline,
                    sd_peer: from,
                },
            )
            .is_none();
        if is_new {
            log::debug!(
                "[SD] discovered 0x{:04x}/0x{:04x} at {}:{} (ttl {}s)",
                key.0,
                key.1,
                instance.endpoint.address,
                instance.endpoint.port,
                entry.ttl
            );
            actions.available.push(instance.clone());
        }

        // A matching offer closes open find windows immediately.
        let mut open = Vec::new();
        for mut find in state.finds.drain(..) {
            let matches = find.service_id == instance.service_id
                && (find.instance_id == ANY_INSTANCE
                    || find.instance_id == instance.instance_id);
            if matches {
                if let Some(callback) = find.callback.take() {
                    actions.find_results.push((callback, vec![instance.clone()]));
                }
            } else {
                open.push(find);
            }
        }
        state.finds = open;
    }

    fn on_stop_offer(
        &self,
        state: &mut EngineState,
        entry: &ServiceEntry,
        actions: &mut Actions,
    ) {
        let key = (entry.service_id, entry.instance_id);
        if let Some(offer) = state.remote.remove(&key) {
            log::debug!("[SD] 0x{:04x}/0x{:04x} withdrew its offer", key.0, key.1);
            actions.unavailable.push(offer.instance);
        }
    }

    fn on_find(
        &self,
        state: &EngineState,
        entry: &ServiceEntry,
        from: SocketAddr,
        actions: &mut Actions,
    ) {
        // Answer with an immediate unicast offer, outside the schedule.
        let matches: Vec<SdEntry> = state
            .offered
            .values()
            .filter(|offered| {
                offered.service.service_id == entry.service_id
                    && (entry.instance_id == ANY_INSTANCE
                        || offered.service.instance_id == entry.instance_id)
                    && !offered.schedule.is_stopped()
            })
            .map(|offered| self.offer_entry(&offered.service, self.cfg.default_ttl))
            .collect();
        if !matches.is_empty() {
            log::debug!(
                "[SD] answering find 0x{:04x} from {} with {} offer(s)",
                entry.service_id,
                from,
                matches.len()
            );
            actions.sends.push((matches, from));
        }
    }

    fn on_subscribe_ack(
        &self,
        state: &mut EngineState,
        entry: &EventgroupEntry,
        actions: &mut Actions,
    ) {
        let key = (entry.service_id, entry.instance_id, entry.eventgroup_id);
        let Some(sub) = state.subscriptions.get_mut(&key) else {
            return;
        };
        if entry.ttl > 0 {
            let was = sub.state;
            sub.state = SubscriptionState::Subscribed;
            sub.ttl_deadline = Instant::now() + Duration::from_secs(u64::from(entry.ttl));
            if was != SubscriptionState::Subscribed {
                actions
                    .status_changes
                    .push((Arc::clone(&sub.on_status), SubscriptionState::Subscribed));
            }
        } else {
            sub.state = SubscriptionState::Rejected;
            actions
                .status_changes
                .push((Arc::clone(&sub.on_status), SubscriptionState::Rejected));
        }
    }

    /// Server-side SUBSCRIBE handling; consults the event bus and emits
    /// exactly one of ACK or NACK.
    fn on_subscribe(&self, entry: &EventgroupEntry, from: SocketAddr) {
        let bus = self.event_bus.lock().clone();
        let subscriber = SdOption::first_endpoint(&entry.options);

        if entry.ttl == 0 {
            // Unsubscribe: drop the subscriber, no reply.
            if let (Some(bus), Some(ep)) = (bus, subscriber) {
                bus.remove_subscriber(
                    entry.eventgroup_id,
                    SocketAddr::new(IpAddr::V4(ep.address), ep.port),
                );
            }
            return;
        }

        let accepted = match (&bus, subscriber) {
            (Some(bus), Some(ep)) if bus.has_eventgroup(entry.eventgroup_id) => bus
                .add_subscriber(
                    entry.eventgroup_id,
                    SocketAddr::new(IpAddr::V4(ep.address), ep.port),
                    None,
                    Duration::from_secs(u64::from(entry.ttl)),
                ),
            _ => false,
        };

        let mut options = Vec::new();
        if accepted {
            if let Some(bus) = &bus {
                if let Some(group) = bus.eventgroup_multicast(entry.eventgroup_id) {
                    if let IpAddr::V4(addr) = group.ip() {
                        options.push(SdOption::Ipv4Multicast(SdEndpoint::udp(
                            addr,
                            group.port(),
                        )));
                    }
                }
            }
        }

        let ack = SdEntry::SubscribeEventgroupAck(EventgroupEntry {
            service_id: entry.service_id,
            instance_id: entry.instance_id,
            major_version: entry.major_version,
            eventgroup_id: entry.eventgroup_id,
            ttl: if accepted { entry.ttl } else { 0 },
            counter: entry.counter,
            options,
        });
        if accepted {
            self.stats.acks_sent.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "[SD] ack subscribe 0x{:04x} group 0x{:04x} from {}",
                entry.service_id,
                entry.eventgroup_id,
                from
            );
        } else {
            self.stats.nacks_sent.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "[SD] nack subscribe 0x{:04x} group 0x{:04x} from {}",
                entry.service_id,
                entry.eventgroup_id,
                from
            );
        }
        if let Err(e) = self.send_sd(vec![ack], from) {
            log::debug!("[SD] failed to answer subscribe from {}: {}", from, e);
        }
    }

    // ===== Internals =====

    fn receive_loop(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::Relaxed) {
            if let Some((msg, from)) = self.transport.receive_timeout(Duration::from_millis(100))
            {
                if msg.is_sd() {
                    self.handle_message(&msg, from);
                } else {
                    self.stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn timer_loop(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::Relaxed) {
            thread::sleep(TICK);
            self.tick();
        }
    }

    /// Deferred work gathered under the lock, executed outside it.
    fn run_actions(&self, actions: Actions) {
        for (entries, dest) in actions.sends {
            self.stats.offers_sent.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.send_sd(entries, dest) {
                log::debug!("[SD] send to {} failed: {}", dest, e);
            }
        }
        for (entry, from) in actions.subscribes {
            self.on_subscribe(&entry, from);
        }
        for (key, endpoint, counter) in actions.refreshes {
            let dest = self.peer_for(key.0, key.1);
            if let Err(e) = self.send_subscribe(key.0, key.1, key.2, endpoint, counter, dest) {
                log::debug!("[SD] subscription refresh failed: {}", e);
            }
        }
        if let Some(handler) = self.availability.lock().clone() {
            for instance in &actions.available {
                handler(instance, true);
            }
            for instance in &actions.unavailable {
                handler(instance, false);
            }
        }
        for (callback, result) in actions.find_results {
            callback(result);
        }
        for (handler, new_state) in actions.status_changes {
            handler(new_state);
        }
    }

    fn send_subscribe(
        &self,
        service_id: u16,
        instance_id: u16,
        eventgroup_id: u16,
        endpoint: SdEndpoint,
        counter: u8,
        dest: SocketAddr,
    ) -> Result<()> {
        let entry = SdEntry::SubscribeEventgroup(EventgroupEntry {
            service_id,
            instance_id,
            major_version: 0xFF,
            eventgroup_id,
            ttl: self.cfg.default_ttl,
            counter,
            options: vec![SdOption::Ipv4Endpoint(endpoint)],
        });
        self.send_sd(vec![entry], dest)
    }

    fn send_sd(&self, entries: Vec<SdEntry>, dest: SocketAddr) -> Result<()> {
        let mut payload = SdPayload::new(entries);
        payload.reboot = self.first_message_pending.swap(false, Ordering::Relaxed);
        let session = loop {
            let next = self.session.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if next != 0 {
                break next;
            }
        };
        self.transport.send(&payload.to_message(session), dest)
    }

    fn offer_entry(&self, service: &OfferedService, ttl: u32) -> SdEntry {
        SdEntry::OfferService(ServiceEntry {
            service_id: service.service_id,
            instance_id: service.instance_id,
            major_version: service.major_version,
            minor_version: service.minor_version,
            ttl,
            options: vec![SdOption::Ipv4Endpoint(service.endpoint)],
        })
    }

    fn group_addr(&self) -> SocketAddr {
        SocketAddr::new(
            IpAddr::V4(self.cfg.multicast_group),
            self.cfg.multicast_port,
        )
    }

    /// Unicast SD endpoint of the peer offering `(service, instance)`,
    /// falling back to the multicast group.
    fn peer_for(&self, service_id: u16, instance_id: u16) -> SocketAddr {
        self.state
            .lock()
            .remote
            .get(&(service_id, instance_id))
            .map(|offer| offer.sd_peer)
            .unwrap_or_else(|| self.group_addr())
    }

    fn ttl_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.cfg.default_ttl))
    }
}

impl Drop for SdEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Work gathered while the state lock is held; callbacks and sends all
/// happen after it is released.
#[derive(Default)]
struct Actions {
    sends: Vec<(Vec<SdEntry>, SocketAddr)>,
    subscribes: Vec<(EventgroupEntry, SocketAddr)>,
    refreshes: Vec<((u16, u16, u16), SdEndpoint, u8)>,
    available: Vec<ServiceInstance>,
    unavailable: Vec<ServiceInstance>,
    find_results: Vec<(FindCallback, Vec<ServiceInstance>)>,
    status_changes: Vec<(StatusHandler, SubscriptionState)>,
}
