// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message framing for SOME/IP over TCP.
//!
//! TCP preserves byte order but not message boundaries: one `recv` can
//! hold half a message or three of them. SOME/IP carries its own length
//! field at header offset 4, so the framer accumulates bytes and cuts
//! whole messages back out:
//!
//! 1. Accumulate into a bounded buffer; on overflow discard everything.
//! 2. With >= 16 bytes available, read the length field and require
//!    `8 <= length <= max_message_size`. An implausible length triggers
//!    a resync scan for the next offset whose first four bytes form a
//!    non-zero message id; everything before it is dropped.
//! 3. Once `8 + length` bytes are buffered, decode and emit; the
//!    remainder stays for the next round.
//!
//! The resync keeps one corrupted length field from jamming the
//! connection indefinitely.

use crate::config::{HEADER_LENGTH, LENGTH_FIELD_OFFSET};
use crate::protocol::message::Message;

/// Statistics counters for one framed stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    pub frames_decoded: u64,
    pub bytes_decoded: u64,
    pub decode_errors: u64,
    pub resyncs: u64,
    pub overflows: u64,
}

/// Stateful reassembler of SOME/IP messages from a byte stream.
#[derive(Debug)]
pub struct StreamFramer {
    buf: Vec<u8>,
    /// Consumed prefix of `buf`; compacted lazily.
    pos: usize,
    max_buffer: usize,
    max_message: usize,
    stats: FramerStats,
}

impl StreamFramer {
    /// `max_buffer` caps accumulation (overflow drops the buffer);
    /// `max_message` bounds the accepted length field.
    pub fn new(max_buffer: usize, max_message: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            pos: 0,
            max_buffer,
            max_message,
            stats: FramerStats::default(),
        }
    }

    /// Append received bytes to the accumulation buffer.
    pub fn feed(&mut self, data: &[u8]) {
        // Compact once the consumed prefix dominates the buffer.
        if self.pos > 0 && self.pos > self.buf.len() / 2 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);

        if self.buf.len() - self.pos > self.max_buffer {
            log::debug!(
                "[Framer] buffer overflow ({} > {}), discarding stream state",
                self.buf.len() - self.pos,
                self.max_buffer
            );
            self.buf.clear();
            self.pos = 0;
            self.stats.overflows += 1;
        }
    }

    /// Extract the next complete message, if one is buffered.
    ///
    /// Call repeatedly after each `feed` until it returns `None`.
    pub fn decode_buffered(&mut self) -> Option<Message> {
        loop {
            let avail = &self.buf[self.pos..];
            if avail.len() < HEADER_LENGTH {
                return None;
            }

            let length = u32::from_be_bytes([avail[4], avail[5], avail[6], avail[7]]) as usize;
            if length < LENGTH_FIELD_OFFSET as usize || length > self.max_message {
                self.resync();
                continue;
            }

            let frame_len = 8 + length;
            if avail.len() < frame_len {
                return None;
            }

            let frame = &self.buf[self.pos..self.pos + frame_len];
            match Message::decode(frame) {
                Ok(msg) => {
                    self.pos += frame_len;
                    self.stats.frames_decoded += 1;
                    self.stats.bytes_decoded += frame_len as u64;
                    return Some(msg);
                }
                Err(e) => {
                    log::debug!("[Framer] dropping undecodable frame: {}", e);
                    self.pos += frame_len;
                    self.stats.decode_errors += 1;
                }
            }
        }
    }

    /// Skip forward to the next plausible message start: the first
    /// offset whose four bytes form a non-zero message id and whose
    /// length field, when already buffered, is in range. With no such
    /// offset the buffer is cleared.
    fn resync(&mut self) {
        self.stats.resyncs += 1;
        let avail = &self.buf[self.pos..];
        let found = (1..avail.len().saturating_sub(3)).find(|&i| {
            let id = u32::from_be_bytes([avail[i], avail[i + 1], avail[i + 2], avail[i + 3]]);
            if id == 0 {
                return false;
            }
            if avail.len() < i + 8 {
                // Length bytes not buffered yet; accept and re-check
                // once they arrive.
                return true;
            }
            let length =
                u32::from_be_bytes([avail[i + 4], avail[i + 5], avail[i + 6], avail[i + 7]])
                    as usize;
            length >= LENGTH_FIELD_OFFSET as usize && length <= self.max_message
        });
        match found {
            Some(skip) => {
                log::debug!("[Framer] resync: skipped {} bytes", skip);
                self.pos += skip;
            }
            None => {
                log::debug!("[Framer] resync failed, clearing {} bytes", avail.len());
                self.buf.clear();
                self.pos = 0;
            }
        }
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn stats(&self) -> FramerStats {
        self.stats
    }

    /// Drop all stream state (after a connection reset).
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{MessageId, MessageType, RequestId};

    fn framer() -> StreamFramer {
        StreamFramer::new(64 * 1024, 64 * 1024)
    }

    fn msg(session: u16, payload: &[u8]) -> Message {
        Message::new(
            MessageId::new(0x1000, 0x0001),
            RequestId::new(0x0001, session),
            MessageType::Request,
            payload.to_vec(),
        )
    }

    #[test]
    fn single_message_in_one_chunk() {
        let mut f = framer();
        let m = msg(1, b"hello");
        f.feed(&m.encode());
        assert_eq!(f.decode_buffered(), Some(m));
        assert_eq!(f.decode_buffered(), None);
        assert_eq!(f.buffered(), 0);
    }

    #[test]
    fn message_split_across_three_chunks() {
        let mut f = framer();
        let m = msg(2, &[0xAB; 100]);
        let encoded = m.encode();
        let (a, rest) = encoded.split_at(7);
        let (b, c) = rest.split_at(40);

        f.feed(a);
        assert_eq!(f.decode_buffered(), None);
        f.feed(b);
        assert_eq!(f.decode_buffered(), None);
        f.feed(c);
        assert_eq!(f.decode_buffered(), Some(m));
    }

    #[test]
    fn coalesced_messages_come_out_separately() {
        let mut f = framer();
        let m1 = msg(3, b"first");
        let m2 = msg(4, b"second");
        let m3 = msg(5, b"");
        let mut stream = m1.encode();
        stream.extend(m2.encode());
        stream.extend(m3.encode());
        f.feed(&stream);

        assert_eq!(f.decode_buffered(), Some(m1));
        assert_eq!(f.decode_buffered(), Some(m2));
        assert_eq!(f.decode_buffered(), Some(m3));
        assert_eq!(f.decode_buffered(), None);
        assert_eq!(f.stats().frames_decoded, 3);
    }

    #[test]
    fn corrupt_length_resyncs_to_next_message() {
        let mut f = framer();
        let good = Message::new(
            MessageId::new(0x0001, 0x0002),
            RequestId::new(0x0001, 6),
            MessageType::Request,
            b"payload".to_vec(),
        );

        // A header-sized junk prefix whose length field is implausible.
        let mut junk = vec![0u8; HEADER_LENGTH];
        junk[4..8].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        junk.extend(good.encode());
        f.feed(&junk);

        assert_eq!(f.decode_buffered(), Some(good));
        assert!(f.stats().resyncs >= 1);
    }

    #[test]
    fn all_zero_garbage_clears_buffer() {
        let mut f = framer();
        f.feed(&[0u8; 64]);
        assert_eq!(f.decode_buffered(), None);
        assert_eq!(f.buffered(), 0);
        assert!(f.stats().resyncs >= 1);
    }

    #[test]
    fn overflow_discards_stream_state() {
        let mut f = StreamFramer::new(128, 64 * 1024);
        // Valid-looking start of a large message that never completes
        // within the buffer cap.
        let mut head = vec![0x10, 0x00, 0x00, 0x01];
        head.extend(&50_000u32.to_be_bytes());
        head.extend([0u8; 8]);
        f.feed(&head);
        f.feed(&[0x55; 200]);

        assert_eq!(f.stats().overflows, 1);
        assert_eq!(f.buffered(), 0);
    }

    #[test]
    fn undecodable_frame_is_counted_and_skipped() {
        let mut f = framer();
        let mut bad = msg(7, b"x").encode();
        bad[12] = 0x09; // wrong protocol version, length still plausible
        let good = msg(8, b"y");
        f.feed(&bad);
        f.feed(&good.encode());

        assert_eq!(f.decode_buffered(), Some(good));
        assert_eq!(f.stats().decode_errors, 1);
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let mut f = framer();
        let m = msg(9, &[1, 2, 3, 4, 5, 6, 7]);
        let mut out = None;
        for &b in &m.encode() {
            f.feed(&[b]);
            if let Some(decoded) = f.decode_buffered() {
                out = Some(decoded);
            }
        }
        assert_eq!(out, Some(m));
    }
}
