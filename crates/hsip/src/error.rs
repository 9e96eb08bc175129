// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error taxonomy.
//!
//! Five categories: network, protocol, resource, timeout, state. Every
//! user-visible failure is delivered through a typed return value or a
//! completion callback; nothing in the stack terminates the process.

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for all HSIP operations.
#[derive(Debug)]
pub enum Error {
    /// Socket-level send/receive/connect failure. Reported, not fatal.
    Network(io::Error),
    /// Wire-format violation (bad header, bad version, bad SD body).
    Protocol(ProtocolError),
    /// An operation was refused to protect existing state.
    Resource(ResourceError),
    /// A bounded wait elapsed without the expected event.
    Timeout(TimeoutKind),
    /// Operation invalid for the current component state.
    State(&'static str),
}

/// Wire-format violations detected by the codec and SD parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer shorter than the 16-byte header, or the length field
    /// disagrees with the buffer size.
    MalformedMessage,
    /// Protocol version byte is not 0x01.
    WrongProtocolVersion(u8),
    /// Message type byte is outside the known set.
    WrongMessageType(u8),
    /// Interface version does not match the served interface.
    WrongInterfaceVersion(u8),
    /// TP segment violates the reassembly invariants (offset past the
    /// total, conflicting totals, zero-length claim).
    InvalidSegment,
    /// SD entry references an option index outside the options array.
    OptionIndexOutOfRange,
    /// SD body truncated or internally inconsistent.
    MalformedSdMessage,
}

/// Refusals that protect memory and table bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    /// Payload exceeds `max_message_size`; segmentation refused.
    MessageTooLarge { size: usize, max: usize },
    /// Reassembly table is at `max_concurrent_transfers`.
    TransfersExhausted,
    /// Stream framer buffer exceeded its cap and was discarded.
    BufferOverflow,
    /// TCP connection table is at `max_connections`.
    ConnectionsExhausted,
}

/// Which bounded wait expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// RPC response deadline.
    Response,
    /// TP reassembly made no progress within `reassembly_timeout`.
    Reassembly,
    /// TCP connect did not complete within `connect_timeout`.
    Connect,
    /// Send did not complete within the configured send timeout.
    Send,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Network(e) => write!(f, "network error: {}", e),
            Error::Protocol(e) => write!(f, "protocol error: {}", e),
            Error::Resource(e) => write!(f, "resource limit: {}", e),
            Error::Timeout(k) => write!(f, "timeout: {}", k),
            Error::State(msg) => write!(f, "invalid state: {}", msg),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::MalformedMessage => write!(f, "malformed message"),
            ProtocolError::WrongProtocolVersion(v) => {
                write!(f, "wrong protocol version 0x{:02x}", v)
            }
            ProtocolError::WrongMessageType(t) => write!(f, "wrong message type 0x{:02x}", t),
            ProtocolError::WrongInterfaceVersion(v) => {
                write!(f, "wrong interface version 0x{:02x}", v)
            }
            ProtocolError::InvalidSegment => write!(f, "invalid TP segment"),
            ProtocolError::OptionIndexOutOfRange => write!(f, "SD option index out of range"),
            ProtocolError::MalformedSdMessage => write!(f, "malformed SD message"),
        }
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::MessageTooLarge { size, max } => {
                write!(f, "message too large: {} bytes (max {})", size, max)
            }
            ResourceError::TransfersExhausted => write!(f, "too many concurrent transfers"),
            ResourceError::BufferOverflow => write!(f, "receive buffer overflow"),
            ResourceError::ConnectionsExhausted => write!(f, "too many connections"),
        }
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Response => write!(f, "response deadline"),
            TimeoutKind::Reassembly => write!(f, "reassembly stalled"),
            TimeoutKind::Connect => write!(f, "connect"),
            TimeoutKind::Send => write!(f, "send"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Network(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Network(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<ResourceError> for Error {
    fn from(e: ResourceError) -> Self {
        Error::Resource(e)
    }
}
