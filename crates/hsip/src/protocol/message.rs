// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SOME/IP message codec.
//!
//! Fixed 16-byte header, big-endian throughout:
//!
//! ```text
//! +--------------------+--------------------+
//! | service id (u16)   | method id (u16)    |
//! +--------------------+--------------------+
//! | length (u32) = 8 + payload              |
//! +--------------------+--------------------+
//! | client id (u16)    | session id (u16)   |
//! +--------+--------+-----------+-----------+
//! | proto  | iface  | msg type  | ret code  |
//! +--------+--------+-----------+-----------+
//! | payload ...                             |
//! +-----------------------------------------+
//! ```
//!
//! The `length` field counts from the request id (offset 8) to the end
//! of the payload. `decode(encode(m)) == m` holds for every well-formed
//! message, including those carrying an out-of-spec message type byte
//! (surfaced as [`MessageType::Unknown`] so the dispatcher can answer
//! `E_WRONG_MESSAGE_TYPE` while the header stays usable).

use crate::config::{
    HEADER_LENGTH, LENGTH_FIELD_OFFSET, MESSAGE_TYPE_RESPONSE_FLAG, MESSAGE_TYPE_TP_FLAG,
    PROTOCOL_VERSION, SD_METHOD_ID, SD_SERVICE_ID,
};
use crate::error::ProtocolError;

/// Identifies a service operation: `service_id` + `method_id`.
///
/// `service_id == 0xFFFF` is reserved for Service Discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub service_id: u16,
    pub method_id: u16,
}

impl MessageId {
    pub fn new(service_id: u16, method_id: u16) -> Self {
        Self {
            service_id,
            method_id,
        }
    }

    pub fn is_sd(&self) -> bool {
        self.service_id == SD_SERVICE_ID && self.method_id == SD_METHOD_ID
    }

    pub fn to_u32(self) -> u32 {
        (u32::from(self.service_id) << 16) | u32::from(self.method_id)
    }

    pub fn from_u32(raw: u32) -> Self {
        Self {
            service_id: (raw >> 16) as u16,
            method_id: (raw & 0xFFFF) as u16,
        }
    }
}

/// Request correlation: `client_id` + `session_id`.
///
/// A zero session id means "no session" on the wire; live RPC sessions
/// are always non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RequestId {
    pub client_id: u16,
    pub session_id: u16,
}

impl RequestId {
    pub fn new(client_id: u16, session_id: u16) -> Self {
        Self {
            client_id,
            session_id,
        }
    }
}

/// Message type byte.
///
/// Bit 0x20 marks a TP segment, bit 0x80 the response side. Values the
/// decoder does not recognize are preserved in `Unknown` so the header
/// still round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request,
    RequestNoReturn,
    Notification,
    RequestAck,
    RequestNoReturnAck,
    NotificationAck,
    Response,
    Error,
    ResponseAck,
    ErrorAck,
    TpRequest,
    TpRequestNoReturn,
    TpNotification,
    TpResponse,
    TpError,
    Unknown(u8),
}

impl MessageType {
    pub fn to_byte(self) -> u8 {
        match self {
            MessageType::Request => 0x00,
            MessageType::RequestNoReturn => 0x01,
            MessageType::Notification => 0x02,
            MessageType::RequestAck => 0x40,
            MessageType::RequestNoReturnAck => 0x41,
            MessageType::NotificationAck => 0x42,
            MessageType::Response => 0x80,
            MessageType::Error => 0x81,
            MessageType::ResponseAck => 0xC0,
            MessageType::ErrorAck => 0xC1,
            MessageType::TpRequest => 0x20,
            MessageType::TpRequestNoReturn => 0x21,
            MessageType::TpNotification => 0x22,
            MessageType::TpResponse => 0xA0,
            MessageType::TpError => 0xA1,
            MessageType::Unknown(raw) => raw,
        }
    }

    pub fn from_byte(raw: u8) -> Self {
        match raw {
            0x00 => MessageType::Request,
            0x01 => MessageType::RequestNoReturn,
            0x02 => MessageType::Notification,
            0x40 => MessageType::RequestAck,
            0x41 => MessageType::RequestNoReturnAck,
            0x42 => MessageType::NotificationAck,
            0x80 => MessageType::Response,
            0x81 => MessageType::Error,
            0xC0 => MessageType::ResponseAck,
            0xC1 => MessageType::ErrorAck,
            0x20 => MessageType::TpRequest,
            0x21 => MessageType::TpRequestNoReturn,
            0x22 => MessageType::TpNotification,
            0xA0 => MessageType::TpResponse,
            0xA1 => MessageType::TpError,
            other => MessageType::Unknown(other),
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, MessageType::Unknown(_))
    }

    /// TP segment flag (0x20).
    pub fn is_tp(self) -> bool {
        self.to_byte() & MESSAGE_TYPE_TP_FLAG != 0
    }

    /// Response-side flag (0x80).
    pub fn is_response_kind(self) -> bool {
        self.to_byte() & MESSAGE_TYPE_RESPONSE_FLAG != 0
    }

    /// The TP variant of this type (`REQUEST` -> `TP_REQUEST`, ...).
    pub fn with_tp_flag(self) -> Self {
        Self::from_byte(self.to_byte() | MESSAGE_TYPE_TP_FLAG)
    }

    /// The base (non-TP) variant of this type.
    pub fn without_tp_flag(self) -> Self {
        Self::from_byte(self.to_byte() & !MESSAGE_TYPE_TP_FLAG)
    }
}

/// Return code byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReturnCode {
    #[default]
    Ok,
    NotOk,
    UnknownService,
    UnknownMethod,
    NotReady,
    NotReachable,
    Timeout,
    WrongProtocolVersion,
    WrongInterfaceVersion,
    MalformedMessage,
    WrongMessageType,
    Unknown(u8),
}

impl ReturnCode {
    pub fn to_byte(self) -> u8 {
        match self {
            ReturnCode::Ok => 0x00,
            ReturnCode::NotOk => 0x01,
            ReturnCode::UnknownService => 0x02,
            ReturnCode::UnknownMethod => 0x03,
            ReturnCode::NotReady => 0x04,
            ReturnCode::NotReachable => 0x05,
            ReturnCode::Timeout => 0x06,
            ReturnCode::WrongProtocolVersion => 0x07,
            ReturnCode::WrongInterfaceVersion => 0x08,
            ReturnCode::MalformedMessage => 0x09,
            ReturnCode::WrongMessageType => 0x0A,
            ReturnCode::Unknown(raw) => raw,
        }
    }

    pub fn from_byte(raw: u8) -> Self {
        match raw {
            0x00 => ReturnCode::Ok,
            0x01 => ReturnCode::NotOk,
            0x02 => ReturnCode::UnknownService,
            0x03 => ReturnCode::UnknownMethod,
            0x04 => ReturnCode::NotReady,
            0x05 => ReturnCode::NotReachable,
            0x06 => ReturnCode::Timeout,
            0x07 => ReturnCode::WrongProtocolVersion,
            0x08 => ReturnCode::WrongInterfaceVersion,
            0x09 => ReturnCode::MalformedMessage,
            0x0A => ReturnCode::WrongMessageType,
            other => ReturnCode::Unknown(other),
        }
    }
}

/// A complete SOME/IP message: header fields plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: MessageId,
    pub request_id: RequestId,
    pub protocol_version: u8,
    pub interface_version: u8,
    pub message_type: MessageType,
    pub return_code: ReturnCode,
    pub payload: Vec<u8>,
}

impl Message {
    /// A message with defaulted version fields and `E_OK`.
    pub fn new(
        message_id: MessageId,
        request_id: RequestId,
        message_type: MessageType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_id,
            request_id,
            protocol_version: PROTOCOL_VERSION,
            interface_version: 0x01,
            message_type,
            return_code: ReturnCode::Ok,
            payload,
        }
    }

    /// Value of the wire `length` field for this message.
    pub fn wire_length(&self) -> u32 {
        LENGTH_FIELD_OFFSET + self.payload.len() as u32
    }

    /// Total encoded size (header + payload).
    pub fn encoded_size(&self) -> usize {
        HEADER_LENGTH + self.payload.len()
    }

    /// Encode into a single contiguous buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        buf.extend_from_slice(&self.message_id.service_id.to_be_bytes());
        buf.extend_from_slice(&self.message_id.method_id.to_be_bytes());
        buf.extend_from_slice(&self.wire_length().to_be_bytes());
        buf.extend_from_slice(&self.request_id.client_id.to_be_bytes());
        buf.extend_from_slice(&self.request_id.session_id.to_be_bytes());
        buf.push(self.protocol_version);
        buf.push(self.interface_version);
        buf.push(self.message_type.to_byte());
        buf.push(self.return_code.to_byte());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a buffer holding exactly one message.
    ///
    /// Fails with `MalformedMessage` when the buffer is shorter than the
    /// header or the length field disagrees with the buffer size, and
    /// with `WrongProtocolVersion` when byte 12 is not 0x01. An unknown
    /// message type byte does NOT fail the decode; it comes back as
    /// [`MessageType::Unknown`].
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LENGTH {
            return Err(ProtocolError::MalformedMessage);
        }

        let service_id = u16::from_be_bytes([buf[0], buf[1]]);
        let method_id = u16::from_be_bytes([buf[2], buf[3]]);
        let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let client_id = u16::from_be_bytes([buf[8], buf[9]]);
        let session_id = u16::from_be_bytes([buf[10], buf[11]]);
        let protocol_version = buf[12];
        let interface_version = buf[13];
        let message_type = MessageType::from_byte(buf[14]);
        let return_code = ReturnCode::from_byte(buf[15]);

        if protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::WrongProtocolVersion(protocol_version));
        }

        let expected = LENGTH_FIELD_OFFSET + (buf.len() - HEADER_LENGTH) as u32;
        if length != expected {
            return Err(ProtocolError::MalformedMessage);
        }

        Ok(Self {
            message_id: MessageId::new(service_id, method_id),
            request_id: RequestId::new(client_id, session_id),
            protocol_version,
            interface_version,
            message_type,
            return_code,
            payload: buf[HEADER_LENGTH..].to_vec(),
        })
    }

    /// Whether this message belongs to the SD protocol.
    pub fn is_sd(&self) -> bool {
        self.message_id.is_sd()
    }

    /// Build the RESPONSE to this REQUEST, echoing ids and versions.
    pub fn response(&self, return_code: ReturnCode, payload: Vec<u8>) -> Self {
        let message_type = match return_code {
            ReturnCode::Ok => MessageType::Response,
            _ => MessageType::Error,
        };
        Self {
            message_id: self.message_id,
            request_id: self.request_id,
            protocol_version: PROTOCOL_VERSION,
            interface_version: self.interface_version,
            message_type,
            return_code,
            payload,
        }
    }
}
