// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HSIP Global Configuration - Single Source of Truth
//!
//! This module centralizes ALL SOME/IP protocol constants and the
//! construction-time configuration records. **NEVER hardcode elsewhere!**

use std::net::Ipv4Addr;
use std::time::Duration;

// =======================================================================
// SOME/IP wire constants (AUTOSAR PRS_SOMEIPProtocol)
// =======================================================================

/// SOME/IP header length in bytes (message id through return code).
pub const HEADER_LENGTH: usize = 16;

/// The `length` field counts bytes from the request id onward, so the
/// wire length is `8 + payload`.
pub const LENGTH_FIELD_OFFSET: u32 = 8;

/// The only supported protocol version.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// TP header length (follows the SOME/IP header on TP segments).
pub const TP_HEADER_LENGTH: usize = 4;

/// Bit in the message type byte marking a TP segment.
pub const MESSAGE_TYPE_TP_FLAG: u8 = 0x20;

/// Bit in the message type byte marking the response side.
pub const MESSAGE_TYPE_RESPONSE_FLAG: u8 = 0x80;

/// Largest payload a single UDP frame can carry (u16 datagram limit
/// minus UDP and SOME/IP headers). Larger payloads go through TP.
pub const MAX_UDP_PAYLOAD: usize = 65_527;

// =======================================================================
// Service Discovery constants (AUTOSAR PRS_SOMEIPServiceDiscoveryProtocol)
// =======================================================================

/// Service id reserved for SD messages.
pub const SD_SERVICE_ID: u16 = 0xFFFF;

/// Method id of SD messages.
pub const SD_METHOD_ID: u16 = 0x8100;

/// Client id carried by SD messages.
pub const SD_CLIENT_ID: u16 = 0x0000;

/// Interface version of the SD protocol itself.
pub const SD_INTERFACE_VERSION: u8 = 0x01;

/// Reboot flag in the SD flags byte.
pub const SD_FLAG_REBOOT: u8 = 0x80;

/// Unicast-capable flag in the SD flags byte.
pub const SD_FLAG_UNICAST: u8 = 0x40;

/// Default SD multicast group. Deployments override this; nothing else
/// in the crate names a group directly.
pub const DEFAULT_SD_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 224, 224, 245);

/// Default SD port (multicast and unicast).
pub const DEFAULT_SD_PORT: u16 = 30490;

/// Default unicast service port when an offer does not override it.
pub const DEFAULT_SERVICE_PORT: u16 = 30490;

// =======================================================================
// Configuration records
// =======================================================================

/// Top-level construction-time configuration.
///
/// All fields carry the defaults from the protocol profile; builders on
/// the nested records override individual values.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub sd: SdConfig,
    pub tp: TpConfig,
    pub tcp: TcpConfig,
    pub rpc: RpcConfig,
}

/// Service Discovery timing and addressing.
#[derive(Debug, Clone)]
pub struct SdConfig {
    /// Multicast group the SD engine joins and offers on.
    pub multicast_group: Ipv4Addr,
    /// Port of the SD multicast group.
    pub multicast_port: u16,
    /// Local unicast SD port (0 = auto-assign).
    pub unicast_port: u16,
    /// Delay before the very first offer.
    pub initial_delay: Duration,
    /// Base interval of the repetition phase.
    pub repetition_base: Duration,
    /// Multiplier applied per repetition cycle.
    pub repetition_multiplier: u32,
    /// Number of repetition cycles before going cyclic.
    pub repetition_max_count: u32,
    /// Interval of the cyclic phase.
    pub cyclic_offer_delay: Duration,
    /// TTL advertised on offers and subscriptions.
    pub default_ttl: u32,
    /// How long a find collects offers before reporting.
    pub response_delay_max: Duration,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            multicast_group: DEFAULT_SD_MULTICAST_GROUP,
            multicast_port: DEFAULT_SD_PORT,
            unicast_port: 0,
            initial_delay: Duration::from_millis(100),
            repetition_base: Duration::from_secs(2),
            repetition_multiplier: 2,
            repetition_max_count: 3,
            cyclic_offer_delay: Duration::from_secs(30),
            default_ttl: 3600,
            response_delay_max: Duration::from_millis(1500),
        }
    }
}

impl SdConfig {
    pub fn with_group(mut self, group: Ipv4Addr, port: u16) -> Self {
        self.multicast_group = group;
        self.multicast_port = port;
        self
    }

    pub fn with_timing(
        mut self,
        initial_delay: Duration,
        repetition_base: Duration,
        repetition_max_count: u32,
        cyclic_offer_delay: Duration,
    ) -> Self {
        self.initial_delay = initial_delay;
        self.repetition_base = repetition_base;
        self.repetition_max_count = repetition_max_count;
        self.cyclic_offer_delay = cyclic_offer_delay;
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.default_ttl = ttl;
        self
    }
}

/// TP segmentation and reassembly bounds.
#[derive(Debug, Clone)]
pub struct TpConfig {
    /// Largest segment payload put on the wire.
    pub max_segment_size: usize,
    /// Largest logical message accepted for segmentation or reassembly.
    pub max_message_size: usize,
    /// A reassembly with no progress for this long is dropped.
    pub reassembly_timeout: Duration,
    /// Cap on simultaneous reassemblies.
    pub max_concurrent_transfers: usize,
    /// Request segment acknowledgments from the peer.
    pub enable_acknowledgments: bool,
}

impl Default for TpConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 1400,
            max_message_size: 1024 * 1024,
            reassembly_timeout: Duration::from_secs(5),
            max_concurrent_transfers: 10,
            enable_acknowledgments: false,
        }
    }
}

impl TpConfig {
    pub fn with_segment_size(mut self, size: usize) -> Self {
        self.max_segment_size = size;
        self
    }

    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }
}

/// TCP transport tuning.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub receive_timeout: Duration,
    pub keep_alive: bool,
    pub keep_alive_interval: Duration,
    /// Framer accumulation cap; a stream exceeding it is discarded.
    pub max_receive_buffer: usize,
    /// Cap on concurrently accepted connections.
    pub max_connections: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(1),
            receive_timeout: Duration::from_millis(100),
            keep_alive: true,
            keep_alive_interval: Duration::from_secs(30),
            max_receive_buffer: 64 * 1024,
            max_connections: 10,
        }
    }
}

/// RPC deadlines.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Deadline for the request send itself.
    pub default_request_timeout: Duration,
    /// Deadline for the matching response.
    pub default_response_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_request_timeout: Duration::from_secs(1),
            default_response_timeout: Duration::from_secs(5),
        }
    }
}

impl RpcConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.default_response_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_profile() {
        let cfg = Config::default();
        assert_eq!(cfg.tp.max_segment_size, 1400);
        assert_eq!(cfg.tp.max_message_size, 1024 * 1024);
        assert_eq!(cfg.tp.max_concurrent_transfers, 10);
        assert_eq!(cfg.sd.multicast_port, 30490);
        assert_eq!(cfg.sd.default_ttl, 3600);
        assert_eq!(cfg.sd.repetition_max_count, 3);
        assert_eq!(cfg.tcp.max_connections, 10);
        assert_eq!(cfg.tcp.max_receive_buffer, 64 * 1024);
        assert_eq!(cfg.rpc.default_response_timeout, Duration::from_secs(5));
    }

    #[test]
    fn builders_override_single_fields() {
        let sd = SdConfig::default()
            .with_group(Ipv4Addr::new(239, 255, 255, 251), 30490)
            .with_ttl(10);
        assert_eq!(sd.multicast_group, Ipv4Addr::new(239, 255, 255, 251));
        assert_eq!(sd.default_ttl, 10);
        // untouched fields keep their defaults
        assert_eq!(sd.cyclic_offer_delay, Duration::from_secs(30));

        let tp = TpConfig::default().with_segment_size(512);
        assert_eq!(tp.max_segment_size, 512);
    }
}
