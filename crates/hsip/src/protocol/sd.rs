// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service Discovery wire format.
//!
//! An SD message is a regular SOME/IP NOTIFICATION with the reserved
//! message id 0xFFFF/0x8100. Its payload:
//!
//! ```text
//! flags: u8 (0x80 reboot, 0x40 unicast) | reserved: u24
//! entries array:  u32 byte length, 16-byte entries
//! options array:  u32 byte length, options
//! ```
//!
//! Entries reference options by index runs (`index1`/`count1`,
//! `index2`/`count2`). The public model resolves the indirection: each
//! [`SdEntry`] owns its options; the encoder deduplicates byte-identical
//! options into the shared array, and the parser rejects the whole
//! message when an entry references an index outside the array.

use crate::config::{SD_CLIENT_ID, SD_FLAG_REBOOT, SD_FLAG_UNICAST, SD_INTERFACE_VERSION, SD_METHOD_ID, SD_SERVICE_ID};
use crate::error::ProtocolError;
use crate::protocol::message::{Message, MessageId, MessageType, RequestId, ReturnCode};
use crate::protocol::ser::{Deserializer, Serializer};
use std::net::Ipv4Addr;

/// Entry type bytes.
const ENTRY_FIND: u8 = 0x00;
const ENTRY_OFFER: u8 = 0x01;
const ENTRY_SUBSCRIBE: u8 = 0x06;
const ENTRY_SUBSCRIBE_ACK: u8 = 0x07;

/// Option type bytes.
const OPTION_IPV4_ENDPOINT: u8 = 0x04;
const OPTION_IPV4_MULTICAST: u8 = 0x14;
const OPTION_IPV4_SD_ENDPOINT: u8 = 0x24;

/// Wire size of one entry.
const ENTRY_SIZE: usize = 16;

/// Wire size of an IPv4 option body (address, reserved, protocol, port).
const IPV4_OPTION_BODY: usize = 8;

/// Transport protocol carried inside IPv4 options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Protocol {
    Tcp,
    Udp,
}

impl L4Protocol {
    pub fn to_byte(self) -> u8 {
        match self {
            L4Protocol::Tcp => 0x06,
            L4Protocol::Udp => 0x11,
        }
    }

    pub fn from_byte(raw: u8) -> Option<Self> {
        match raw {
            0x06 => Some(L4Protocol::Tcp),
            0x11 => Some(L4Protocol::Udp),
            _ => None,
        }
    }
}

/// An endpoint carried by an SD option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SdEndpoint {
    pub address: Ipv4Addr,
    pub protocol: L4Protocol,
    pub port: u16,
}

impl SdEndpoint {
    pub fn udp(address: Ipv4Addr, port: u16) -> Self {
        Self {
            address,
            protocol: L4Protocol::Udp,
            port,
        }
    }

    pub fn tcp(address: Ipv4Addr, port: u16) -> Self {
        Self {
            address,
            protocol: L4Protocol::Tcp,
            port,
        }
    }
}

/// SD option variants. All three kinds share the IPv4 body layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdOption {
    /// Unicast endpoint a service or subscriber is reachable on (0x04).
    Ipv4Endpoint(SdEndpoint),
    /// Multicast group events are distributed on (0x14).
    Ipv4Multicast(SdEndpoint),
    /// SD endpoint of the sending engine itself (0x24).
    Ipv4SdEndpoint(SdEndpoint),
}

impl SdOption {
    fn type_byte(&self) -> u8 {
        match self {
            SdOption::Ipv4Endpoint(_) => OPTION_IPV4_ENDPOINT,
            SdOption::Ipv4Multicast(_) => OPTION_IPV4_MULTICAST,
            SdOption::Ipv4SdEndpoint(_) => OPTION_IPV4_SD_ENDPOINT,
        }
    }

    fn endpoint(&self) -> &SdEndpoint {
        match self {
            SdOption::Ipv4Endpoint(e) | SdOption::Ipv4Multicast(e) | SdOption::Ipv4SdEndpoint(e) => e,
        }
    }

    /// First unicast endpoint among `options`, if any.
    pub fn first_endpoint(options: &[SdOption]) -> Option<SdEndpoint> {
        options.iter().find_map(|o| match o {
            SdOption::Ipv4Endpoint(e) => Some(*e),
            _ => None,
        })
    }

    /// First multicast option among `options`, if any.
    pub fn first_multicast(options: &[SdOption]) -> Option<SdEndpoint> {
        options.iter().find_map(|o| match o {
            SdOption::Ipv4Multicast(e) => Some(*e),
            _ => None,
        })
    }
}

/// Body shared by FIND and OFFER entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    pub minor_version: u32,
    /// Seconds; 0 turns an OFFER into a STOP_OFFER.
    pub ttl: u32,
    pub options: Vec<SdOption>,
}

/// Body shared by SUBSCRIBE and SUBSCRIBE_ACK entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventgroupEntry {
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    pub eventgroup_id: u16,
    /// Seconds; 0 turns a SUBSCRIBE into an unsubscribe and an ACK into
    /// a NACK.
    pub ttl: u32,
    /// Retry counter distinguishing parallel subscribes (low 4 bits on
    /// the wire).
    pub counter: u8,
    pub options: Vec<SdOption>,
}

/// One SD entry with its resolved options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdEntry {
    FindService(ServiceEntry),
    OfferService(ServiceEntry),
    SubscribeEventgroup(EventgroupEntry),
    SubscribeEventgroupAck(EventgroupEntry),
}

impl SdEntry {
    pub fn find(service_id: u16, instance_id: u16) -> Self {
        SdEntry::FindService(ServiceEntry {
            service_id,
            instance_id,
            major_version: 0xFF,
            minor_version: 0xFFFF_FFFF,
            ttl: 0xFF_FFFF,
            options: Vec::new(),
        })
    }

    fn options(&self) -> &[SdOption] {
        match self {
            SdEntry::FindService(e) | SdEntry::OfferService(e) => &e.options,
            SdEntry::SubscribeEventgroup(e) | SdEntry::SubscribeEventgroupAck(e) => &e.options,
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            SdEntry::FindService(_) => ENTRY_FIND,
            SdEntry::OfferService(_) => ENTRY_OFFER,
            SdEntry::SubscribeEventgroup(_) => ENTRY_SUBSCRIBE,
            SdEntry::SubscribeEventgroupAck(_) => ENTRY_SUBSCRIBE_ACK,
        }
    }
}

/// Decoded SD payload: header flags plus entries with resolved options.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SdPayload {
    pub reboot: bool,
    pub unicast: bool,
    pub entries: Vec<SdEntry>,
}

impl SdPayload {
    pub fn new(entries: Vec<SdEntry>) -> Self {
        Self {
            reboot: false,
            unicast: true,
            entries,
        }
    }

    /// Encode flags, entries array and deduplicated options array.
    pub fn encode(&self) -> Vec<u8> {
        // Dedup pass: byte-identical options share one slot.
        let mut pool: Vec<SdOption> = Vec::new();
        let mut runs: Vec<(u8, u8)> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let opts = entry.options();
            if opts.is_empty() {
                runs.push((0, 0));
                continue;
            }
            // Reuse an existing contiguous run when the exact sequence is
            // already in the pool; otherwise append (appending keeps each
            // entry's options contiguous, which index runs require).
            let start = find_run(&pool, opts).unwrap_or_else(|| {
                let at = pool.len();
                pool.extend_from_slice(opts);
                at
            });
            runs.push((start as u8, opts.len() as u8));
        }

        let mut entries_ser = Serializer::with_capacity(self.entries.len() * ENTRY_SIZE);
        for (entry, &(index1, count1)) in self.entries.iter().zip(&runs) {
            entries_ser.write_u8(entry.type_byte());
            entries_ser.write_u8(index1);
            entries_ser.write_u8(0); // index2 unused
            entries_ser.write_u8(count1 << 4); // count2 = 0
            match entry {
                SdEntry::FindService(e) | SdEntry::OfferService(e) => {
                    entries_ser.write_u16(e.service_id);
                    entries_ser.write_u16(e.instance_id);
                    entries_ser.write_u8(e.major_version);
                    write_u24(&mut entries_ser, e.ttl);
                    entries_ser.write_u32(e.minor_version);
                }
                SdEntry::SubscribeEventgroup(e) | SdEntry::SubscribeEventgroupAck(e) => {
                    entries_ser.write_u16(e.service_id);
                    entries_ser.write_u16(e.instance_id);
                    entries_ser.write_u8(e.major_version);
                    write_u24(&mut entries_ser, e.ttl);
                    entries_ser.write_u16(u16::from(e.counter & 0x0F));
                    entries_ser.write_u16(e.eventgroup_id);
                }
            }
        }

        let mut options_ser = Serializer::new();
        for option in &pool {
            options_ser.write_u16(IPV4_OPTION_BODY as u16);
            options_ser.write_u8(option.type_byte());
            let ep = option.endpoint();
            options_ser.write_bytes(&ep.address.octets());
            options_ser.write_u8(0); // reserved
            options_ser.write_u8(ep.protocol.to_byte());
            options_ser.write_u16(ep.port);
        }

        let mut flags = 0u8;
        if self.reboot {
            flags |= SD_FLAG_REBOOT;
        }
        if self.unicast {
            flags |= SD_FLAG_UNICAST;
        }

        let entries_bytes = entries_ser.into_bytes();
        let options_bytes = options_ser.into_bytes();
        let mut out = Serializer::with_capacity(12 + entries_bytes.len() + options_bytes.len());
        out.write_u8(flags);
        write_u24(&mut out, 0); // reserved
        out.write_u32(entries_bytes.len() as u32);
        out.write_bytes(&entries_bytes);
        out.write_u32(options_bytes.len() as u32);
        out.write_bytes(&options_bytes);
        out.into_bytes()
    }

    /// Decode an SD payload, resolving every entry's option run.
    ///
    /// Any entry whose run points outside the options array rejects the
    /// whole message. Options of unknown type are tolerated and simply
    /// dropped from the entries that reference them.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut de = Deserializer::new(buf);
        let malformed = |_| ProtocolError::MalformedSdMessage;

        let flags = de.read_u8().map_err(malformed)?;
        read_u24(&mut de).map_err(malformed)?;

        let entries_len = de.read_u32().map_err(malformed)? as usize;
        if entries_len % ENTRY_SIZE != 0 {
            return Err(ProtocolError::MalformedSdMessage);
        }
        let entries_raw = de.read_bytes(entries_len).map_err(malformed)?.to_vec();

        let options_len = de.read_u32().map_err(malformed)? as usize;
        let options_raw = de.read_bytes(options_len).map_err(malformed)?;
        let options = parse_options(options_raw)?;

        let mut entries = Vec::with_capacity(entries_raw.len() / ENTRY_SIZE);
        let mut ed = Deserializer::new(&entries_raw);
        while !ed.is_eof() {
            let entry_type = ed.read_u8().map_err(malformed)?;
            let index1 = ed.read_u8().map_err(malformed)? as usize;
            let index2 = ed.read_u8().map_err(malformed)? as usize;
            let counts = ed.read_u8().map_err(malformed)?;
            let count1 = (counts >> 4) as usize;
            let count2 = (counts & 0x0F) as usize;

            let mut resolved = resolve_run(&options, index1, count1)?;
            resolved.extend(resolve_run(&options, index2, count2)?);

            let service_id = ed.read_u16().map_err(malformed)?;
            let instance_id = ed.read_u16().map_err(malformed)?;
            let major_version = ed.read_u8().map_err(malformed)?;
            let ttl = read_u24(&mut ed).map_err(malformed)?;

            match entry_type {
                ENTRY_FIND | ENTRY_OFFER => {
                    let minor_version = ed.read_u32().map_err(malformed)?;
                    let body = ServiceEntry {
                        service_id,
                        instance_id,
                        major_version,
                        minor_version,
                        ttl,
                        options: resolved,
                    };
                    entries.push(if entry_type == ENTRY_FIND {
                        SdEntry::FindService(body)
                    } else {
                        SdEntry::OfferService(body)
                    });
                }
                ENTRY_SUBSCRIBE | ENTRY_SUBSCRIBE_ACK => {
                    let reserved = ed.read_u16().map_err(malformed)?;
                    let eventgroup_id = ed.read_u16().map_err(malformed)?;
                    let body = EventgroupEntry {
                        service_id,
                        instance_id,
                        major_version,
                        eventgroup_id,
                        ttl,
                        counter: (reserved & 0x0F) as u8,
                        options: resolved,
                    };
                    entries.push(if entry_type == ENTRY_SUBSCRIBE {
                        SdEntry::SubscribeEventgroup(body)
                    } else {
                        SdEntry::SubscribeEventgroupAck(body)
                    });
                }
                other => {
                    log::debug!("[SD] skipping entry of unknown type 0x{:02x}", other);
                    // Consume the remaining 4 body bytes to stay aligned.
                    ed.read_bytes(4).map_err(malformed)?;
                }
            }
        }

        Ok(Self {
            reboot: flags & SD_FLAG_REBOOT != 0,
            unicast: flags & SD_FLAG_UNICAST != 0,
            entries,
        })
    }

    /// Wrap this payload in the SD SOME/IP message envelope.
    pub fn to_message(&self, session_id: u16) -> Message {
        Message {
            message_id: MessageId::new(SD_SERVICE_ID, SD_METHOD_ID),
            request_id: RequestId::new(SD_CLIENT_ID, session_id),
            protocol_version: crate::config::PROTOCOL_VERSION,
            interface_version: SD_INTERFACE_VERSION,
            message_type: MessageType::Notification,
            return_code: ReturnCode::Ok,
            payload: self.encode(),
        }
    }

    /// Parse an SD payload out of a full SOME/IP message.
    pub fn from_message(msg: &Message) -> Result<Self, ProtocolError> {
        if !msg.is_sd() {
            return Err(ProtocolError::MalformedSdMessage);
        }
        Self::decode(&msg.payload)
    }
}

fn write_u24(ser: &mut Serializer, value: u32) {
    ser.write_u8((value >> 16) as u8);
    ser.write_u8((value >> 8) as u8);
    ser.write_u8(value as u8);
}

fn read_u24(de: &mut Deserializer<'_>) -> crate::protocol::ser::SerResult<u32> {
    let hi = u32::from(de.read_u8()?);
    let mid = u32::from(de.read_u8()?);
    let lo = u32::from(de.read_u8()?);
    Ok((hi << 16) | (mid << 8) | lo)
}

/// Find `needle` as a contiguous run inside `pool`.
fn find_run(pool: &[SdOption], needle: &[SdOption]) -> Option<usize> {
    if needle.len() > pool.len() {
        return None;
    }
    (0..=pool.len() - needle.len()).find(|&i| &pool[i..i + needle.len()] == needle)
}

/// Parse the options array; unknown types become `None` placeholders so
/// entry index runs still line up.
fn parse_options(raw: &[u8]) -> Result<Vec<Option<SdOption>>, ProtocolError> {
    let mut de = Deserializer::new(raw);
    let mut options = Vec::new();
    while !de.is_eof() {
        let malformed = |_| ProtocolError::MalformedSdMessage;
        let length = de.read_u16().map_err(malformed)? as usize;
        let option_type = de.read_u8().map_err(malformed)?;
        let body = de.read_bytes(length).map_err(malformed)?;

        let parsed = match option_type {
            OPTION_IPV4_ENDPOINT | OPTION_IPV4_MULTICAST | OPTION_IPV4_SD_ENDPOINT => {
                if body.len() != IPV4_OPTION_BODY {
                    return Err(ProtocolError::MalformedSdMessage);
                }
                let address = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let protocol = match L4Protocol::from_byte(body[5]) {
                    Some(p) => p,
                    None => {
                        log::debug!("[SD] option with unknown L4 protocol 0x{:02x}", body[5]);
                        options.push(None);
                        continue;
                    }
                };
                let port = u16::from_be_bytes([body[6], body[7]]);
                let ep = SdEndpoint {
                    address,
                    protocol,
                    port,
                };
                Some(match option_type {
                    OPTION_IPV4_ENDPOINT => SdOption::Ipv4Endpoint(ep),
                    OPTION_IPV4_MULTICAST => SdOption::Ipv4Multicast(ep),
                    _ => SdOption::Ipv4SdEndpoint(ep),
                })
            }
            other => {
                log::debug!("[SD] skipping option of unknown type 0x{:02x}", other);
                None
            }
        };
        options.push(parsed);
    }
    Ok(options)
}

/// Resolve one index run, rejecting out-of-range references.
fn resolve_run(
    options: &[Option<SdOption>],
    index: usize,
    count: usize,
) -> Result<Vec<SdOption>, ProtocolError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if index + count > options.len() {
        return Err(ProtocolError::OptionIndexOutOfRange);
    }
    Ok(options[index..index + count].iter().filter_map(|o| *o).collect())
}
