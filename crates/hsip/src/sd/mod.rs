// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service Discovery engine.
//!
//! Offers local services on the SD multicast group with the timed
//! re-offer schedule, tracks remote offers with TTL expiry, answers
//! finds, and negotiates eventgroup subscriptions (SUBSCRIBE /
//! ACK / NACK).

/// Engine: offer/find/subscribe processing and timers.
pub mod engine;
/// Offer announcement phase machine.
pub mod schedule;

pub use engine::{SdEngine, SdStats};
pub use schedule::{OfferPhase, OfferSchedule};

use crate::protocol::sd::SdEndpoint;
use std::sync::Arc;

/// A remote service instance learned from an OFFER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    pub minor_version: u32,
    /// Where the service's methods and events are reachable.
    pub endpoint: SdEndpoint,
    /// Offer lifetime in seconds.
    pub ttl: u32,
}

/// A locally offered service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedService {
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    pub minor_version: u32,
    /// Endpoint advertised in the offer's options.
    pub endpoint: SdEndpoint,
}

/// Instance id wildcard in finds.
pub const ANY_INSTANCE: u16 = 0xFFFF;

/// Fired when a remote instance appears or disappears.
pub type AvailabilityHandler = Arc<dyn Fn(&ServiceInstance, bool) + Send + Sync>;

/// One-shot result sink of `find_service`.
pub type FindCallback = Box<dyn FnOnce(Vec<ServiceInstance>) + Send>;

/// Fired on every client-side subscription state change.
pub type StatusHandler = Arc<dyn Fn(crate::events::SubscriptionState) + Send + Sync>;
