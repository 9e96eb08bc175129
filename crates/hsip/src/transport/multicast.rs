// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast group management and interface discovery.
//!
//! The SD engine is the only multicast consumer: its transport binds
//! the group port with SO_REUSEADDR, joins the configured group on all
//! non-loopback interfaces, and enables loopback so co-located stacks
//! discover each other.

use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Join `group` on all suitable interfaces.
///
/// Joining per interface instead of relying on the default route makes
/// discovery work on multi-homed hosts. Returns the primary interface
/// to use for outgoing traffic (UNSPECIFIED when none was found).
pub fn join_multicast_group(socket: &UdpSocket, group: Ipv4Addr) -> io::Result<Ipv4Addr> {
    let interfaces = get_multicast_interfaces();

    if interfaces.is_empty() {
        log::debug!("[UDP] no suitable multicast interfaces, joining on UNSPECIFIED");
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    } else {
        for iface in &interfaces {
            match socket.join_multicast_v4(&group, iface) {
                Ok(()) => {
                    log::debug!("[UDP] join_multicast_v4({}) on interface {}", group, iface);
                }
                Err(e) => {
                    // Non-fatal: interfaces that cannot join are skipped.
                    log::debug!(
                        "[UDP] join_multicast_v4({}) on {} failed (non-fatal): {}",
                        group,
                        iface,
                        e
                    );
                }
            }
        }
    }

    socket.set_multicast_loop_v4(true)?;
    let _ = socket.set_multicast_ttl_v4(1);

    Ok(interfaces.first().copied().unwrap_or(Ipv4Addr::UNSPECIFIED))
}

/// All non-loopback IPv4 interfaces suitable for multicast.
pub fn get_multicast_interfaces() -> Vec<Ipv4Addr> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            log::debug!("[UDP] failed to list network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut addrs = Vec::new();
    for (_name, ip) in interfaces {
        if let IpAddr::V4(ipv4) = ip {
            if !ipv4.is_loopback() {
                addrs.push(ipv4);
            }
        }
    }
    addrs
}

/// Primary interface IP, used when announcing our own endpoints.
///
/// Falls back to UNSPECIFIED when interface enumeration comes up empty.
pub fn get_primary_interface_ip() -> Ipv4Addr {
    get_multicast_interfaces()
        .first()
        .copied()
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}
