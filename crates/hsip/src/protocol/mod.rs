// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SOME/IP wire protocol: message codec, payload serializer, SD body.

/// Message header codec and the message/type/return-code model.
pub mod message;
/// Service Discovery entries, options and payload codec.
pub mod sd;
/// Big-endian primitive/string/array serializer.
pub mod ser;

pub use message::{Message, MessageId, MessageType, RequestId, ReturnCode};
pub use sd::{EventgroupEntry, L4Protocol, SdEndpoint, SdEntry, SdOption, SdPayload, ServiceEntry};
pub use ser::{Deserializer, SerError, SerResult, Serializer};
