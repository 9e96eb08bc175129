// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Segmentation of oversized messages into TP segments.

use super::TpHeader;
use crate::config::{TpConfig, TP_HEADER_LENGTH};
use crate::error::{Error, ResourceError, Result};
use crate::protocol::message::Message;

/// Whether a message must travel through TP.
pub fn needs_segmentation(msg: &Message, cfg: &TpConfig) -> bool {
    msg.payload.len() > cfg.max_segment_size
}

/// Split a message into TP segments of at most `max_segment_size` bytes.
///
/// Every segment reuses the original header fields (same session id, so
/// the receiver can key the reassembly) with the message type's TP flag
/// set and the 4-byte TP header prepended to the chunk. A message that
/// does not need segmentation comes back unchanged as a single element.
///
/// Payloads above `max_message_size` are refused outright: a cap that
/// fails before any bytes hit the wire beats a half-sent message.
pub fn segment_message(msg: &Message, cfg: &TpConfig) -> Result<Vec<Message>> {
    let total = msg.payload.len();
    if total > cfg.max_message_size {
        return Err(Error::Resource(ResourceError::MessageTooLarge {
            size: total,
            max: cfg.max_message_size,
        }));
    }
    if !needs_segmentation(msg, cfg) {
        return Ok(vec![msg.clone()]);
    }

    let seg_size = cfg.max_segment_size;
    let count = total.div_ceil(seg_size);
    let mut segments = Vec::with_capacity(count);

    for index in 0..count {
        let start = index * seg_size;
        let end = (start + seg_size).min(total);
        let more = end < total;

        let tp_header = TpHeader::new(start as u32, more);
        let mut payload = Vec::with_capacity(TP_HEADER_LENGTH + (end - start));
        payload.extend_from_slice(&tp_header.encode());
        payload.extend_from_slice(&msg.payload[start..end]);

        segments.push(Message {
            message_id: msg.message_id,
            request_id: msg.request_id,
            protocol_version: msg.protocol_version,
            interface_version: msg.interface_version,
            message_type: msg.message_type.with_tp_flag(),
            return_code: msg.return_code,
            payload,
        });
    }

    log::debug!(
        "[TP] segmented {}B into {} segments of <={}B (service=0x{:04x} session=0x{:04x})",
        total,
        segments.len(),
        seg_size,
        msg.message_id.service_id,
        msg.request_id.session_id
    );
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{MessageId, MessageType, RequestId};

    fn message(len: usize) -> Message {
        Message::new(
            MessageId::new(0x1000, 0x0001),
            RequestId::new(0x1234, 0x0042),
            MessageType::Request,
            (0..len).map(|i| (i % 251) as u8).collect(),
        )
    }

    fn cfg() -> TpConfig {
        TpConfig::default()
    }

    #[test]
    fn payload_at_cap_stays_single_message() {
        let msg = message(1400);
        assert!(!needs_segmentation(&msg, &cfg()));
        let out = segment_message(&msg, &cfg()).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], msg);
        assert!(!out[0].message_type.is_tp());
    }

    #[test]
    fn payload_one_past_cap_makes_two_segments() {
        let msg = message(1401);
        let out = segment_message(&msg, &cfg()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload.len(), 4 + 1400);
        assert_eq!(out[1].payload.len(), 4 + 1);
    }

    #[test]
    fn five_thousand_bytes_make_four_segments() {
        let msg = message(5000);
        let out = segment_message(&msg, &cfg()).unwrap();
        assert_eq!(out.len(), 4);

        let expected = [(0u32, 1400usize, true), (1400, 1400, true), (2800, 1400, true), (4200, 800, false)];
        for (seg, (offset, len, more)) in out.iter().zip(expected) {
            assert_eq!(seg.message_type, MessageType::TpRequest);
            assert_eq!(seg.request_id, msg.request_id);
            let (h, body) = TpHeader::decode(&seg.payload).unwrap();
            assert_eq!(h.offset, offset);
            assert_eq!(h.more_segments, more);
            assert_eq!(body.len(), len);
            assert_eq!(body, &msg.payload[offset as usize..offset as usize + len]);
        }
    }

    #[test]
    fn notification_becomes_tp_notification() {
        let mut msg = message(3000);
        msg.message_type = MessageType::Notification;
        let out = segment_message(&msg, &cfg()).unwrap();
        assert!(out.iter().all(|s| s.message_type == MessageType::TpNotification));
    }

    #[test]
    fn oversized_payload_is_refused() {
        let msg = message(1024 * 1024 + 1);
        let err = segment_message(&msg, &cfg()).unwrap_err();
        assert!(matches!(
            err,
            Error::Resource(ResourceError::MessageTooLarge { .. })
        ));
    }
}
