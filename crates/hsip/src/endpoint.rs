// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoint addressing.
//!
//! An endpoint names a transport flavor plus an IP address and port,
//! written as `protocol://addr:port`:
//!
//! ```
//! use hsip::endpoint::{Endpoint, Protocol};
//!
//! let ep: Endpoint = "udp://192.168.1.20:30490".parse().unwrap();
//! assert_eq!(ep.protocol, Protocol::Udp);
//! assert_eq!(ep.port(), 30490);
//! ```
//!
//! Port 0 means "auto-assign". Multicast endpoints must carry an IPv4
//! address in 224.0.0.0/4.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Transport flavor of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
    Multicast,
}

impl Protocol {
    /// Scheme string used in the textual form.
    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Multicast => "multicast",
        }
    }
}

/// A parse failure for the `protocol://addr:port` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointParseError {
    MissingScheme,
    UnknownScheme(String),
    InvalidAddress(String),
    InvalidPort(String),
    NotMulticast(IpAddr),
}

impl fmt::Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointParseError::MissingScheme => write!(f, "missing 'protocol://' prefix"),
            EndpointParseError::UnknownScheme(s) => write!(f, "unknown protocol '{}'", s),
            EndpointParseError::InvalidAddress(s) => write!(f, "invalid address '{}'", s),
            EndpointParseError::InvalidPort(s) => write!(f, "invalid port '{}'", s),
            EndpointParseError::NotMulticast(a) => {
                write!(f, "'{}' is not a multicast address", a)
            }
        }
    }
}

impl std::error::Error for EndpointParseError {}

/// Transport address of a peer or local socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(protocol: Protocol, addr: IpAddr, port: u16) -> Self {
        Self {
            protocol,
            addr,
            port,
        }
    }

    pub fn udp(addr: IpAddr, port: u16) -> Self {
        Self::new(Protocol::Udp, addr, port)
    }

    pub fn tcp(addr: IpAddr, port: u16) -> Self {
        Self::new(Protocol::Tcp, addr, port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the port requests OS auto-assignment.
    pub fn is_auto_port(&self) -> bool {
        self.port == 0
    }

    /// IPv4 multicast range check (224.0.0.0/4).
    pub fn is_multicast_addr(&self) -> bool {
        match self.addr {
            IpAddr::V4(v4) => v4.is_multicast(),
            IpAddr::V6(v6) => v6.is_multicast(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    pub fn from_socket_addr(protocol: Protocol, addr: SocketAddr) -> Self {
        Self::new(protocol, addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(a) => write!(f, "{}://{}:{}", self.protocol.scheme(), a, self.port),
            IpAddr::V6(a) => write!(f, "{}://[{}]:{}", self.protocol.scheme(), a, self.port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or(EndpointParseError::MissingScheme)?;

        let protocol = match scheme {
            "udp" => Protocol::Udp,
            "tcp" => Protocol::Tcp,
            "multicast" => Protocol::Multicast,
            other => return Err(EndpointParseError::UnknownScheme(other.to_string())),
        };

        let (addr_str, port_str) = split_host_port(rest)?;

        let addr = IpAddr::from_str(addr_str)
            .map_err(|_| EndpointParseError::InvalidAddress(addr_str.to_string()))?;

        let port = port_str
            .parse::<u16>()
            .map_err(|_| EndpointParseError::InvalidPort(port_str.to_string()))?;

        let ep = Endpoint::new(protocol, addr, port);
        if protocol == Protocol::Multicast && !ep.is_multicast_addr() {
            return Err(EndpointParseError::NotMulticast(addr));
        }
        Ok(ep)
    }
}

/// Split `addr:port`, handling the `[v6]:port` bracket form.
fn split_host_port(s: &str) -> Result<(&str, &str), EndpointParseError> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| EndpointParseError::InvalidAddress(s.to_string()))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| EndpointParseError::InvalidPort(tail.to_string()))?;
        Ok((host, port))
    } else {
        s.rsplit_once(':')
            .ok_or_else(|| EndpointParseError::InvalidPort(s.to_string()))
    }
}
