// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Out-of-order TP reassembly.
//!
//! Segments for one logical message can arrive in any order, duplicated,
//! or not at all. The reassembler buffers them per key, tracks coverage
//! with a coalescing interval list, and hands back the rebuilt message
//! exactly once when coverage closes over `[0, total)`.
//!
//! Memory bounds:
//! - at most `max_concurrent_transfers` live buffers,
//! - no buffer ever grows past `max_message_size` (the claim is checked
//!   before allocating),
//! - buffers with no progress for `reassembly_timeout` are evicted by
//!   the periodic sweep.

use super::TpHeader;
use crate::config::TpConfig;
use crate::error::{Error, ProtocolError, ResourceError, Result};
use crate::protocol::message::Message;
use std::collections::HashMap;
use std::time::Instant;

/// Reassembly key: all segments of one logical message share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    pub service_id: u16,
    pub method_id: u16,
    pub client_id: u16,
    pub session_id: u16,
}

impl ReassemblyKey {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            service_id: msg.message_id.service_id,
            method_id: msg.message_id.method_id,
            client_id: msg.request_id.client_id,
            session_id: msg.request_id.session_id,
        }
    }
}

/// Counters exposed for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub completed: u64,
    pub expired: u64,
    pub invalid_segments: u64,
    pub duplicate_segments: u64,
}

/// One in-progress logical message.
struct Buffer {
    /// Header template taken from the first segment seen.
    base: Message,
    data: Vec<u8>,
    /// Sorted, coalesced covered ranges.
    covered: Vec<(usize, usize)>,
    /// Fixed once a LAST segment arrives.
    total: Option<usize>,
    started: Instant,
    last_progress: Instant,
}

impl Buffer {
    fn new(base: Message, now: Instant) -> Self {
        Self {
            base,
            data: Vec::new(),
            covered: Vec::new(),
            total: None,
            started: now,
            last_progress: now,
        }
    }

    fn is_covered(&self, start: usize, end: usize) -> bool {
        self.covered.iter().any(|&(s, e)| s <= start && end <= e)
    }

    /// Insert `[start, end)` and coalesce adjacent/overlapping ranges.
    fn mark(&mut self, start: usize, end: usize) {
        let at = self
            .covered
            .partition_point(|&(s, _)| s < start);
        self.covered.insert(at, (start, end));

        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(self.covered.len());
        for &(s, e) in &self.covered {
            match merged.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }
        self.covered = merged;
    }

    fn is_complete(&self) -> bool {
        match self.total {
            Some(total) => self.covered == [(0, total)],
            None => false,
        }
    }
}

/// Reassembly table keyed by `(service, method, client, session)`.
pub struct Reassembler {
    pending: HashMap<ReassemblyKey, Buffer>,
    cfg: TpConfig,
    stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new(cfg: TpConfig) -> Self {
        Self {
            pending: HashMap::with_capacity(cfg.max_concurrent_transfers),
            cfg,
            stats: ReassemblyStats::default(),
        }
    }

    /// Feed one TP segment.
    ///
    /// Returns `Ok(Some(message))` when this segment completes the
    /// logical message, `Ok(None)` while more are needed (duplicates
    /// land here too). An invalid segment abandons its buffer and the
    /// next segment for the same key starts fresh; other keys are
    /// untouched.
    pub fn insert(&mut self, msg: &Message) -> Result<Option<Message>> {
        if !msg.message_type.is_tp() {
            return Err(Error::Protocol(ProtocolError::InvalidSegment));
        }
        let (header, body) = match TpHeader::decode(&msg.payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.invalid_segments += 1;
                return Err(e.into());
            }
        };

        let key = ReassemblyKey::from_message(msg);
        let start = header.offset as usize;
        let end = start + body.len();

        if let Err(e) = self.validate_segment(&key, &header, start, end) {
            self.stats.invalid_segments += 1;
            self.pending.remove(&key);
            return Err(e);
        }

        let now = Instant::now();
        if !self.pending.contains_key(&key) {
            if self.pending.len() >= self.cfg.max_concurrent_transfers {
                log::debug!(
                    "[TpBuf] transfer table full ({}), refusing new reassembly",
                    self.pending.len()
                );
                return Err(Error::Resource(ResourceError::TransfersExhausted));
            }
            let mut base = msg.clone();
            base.payload = Vec::new();
            self.pending.insert(key, Buffer::new(base, now));
        }
        // Just inserted above when absent.
        let buffer = match self.pending.get_mut(&key) {
            Some(b) => b,
            None => return Ok(None),
        };

        if !header.more_segments {
            buffer.total = Some(end);
        }

        if body.is_empty() || buffer.is_covered(start, end) {
            self.stats.duplicate_segments += 1;
            log::debug!(
                "[TpBuf] duplicate segment offset={} len={} session=0x{:04x}",
                start,
                body.len(),
                key.session_id
            );
            return Ok(None);
        }

        if end > buffer.data.len() {
            buffer.data.resize(end, 0);
        }
        buffer.data[start..end].copy_from_slice(body);
        buffer.mark(start, end);
        buffer.last_progress = now;

        log::debug!(
            "[TpBuf] stored offset={} len={} covered={:?} total={:?} session=0x{:04x}",
            start,
            body.len(),
            buffer.covered,
            buffer.total,
            key.session_id
        );

        if buffer.is_complete() {
            // Complete: remove the buffer and rebuild the base message.
            if let Some(buffer) = self.pending.remove(&key) {
                self.stats.completed += 1;
                let mut complete = buffer.base;
                complete.message_type = complete.message_type.without_tp_flag();
                complete.payload = buffer.data;
                log::debug!(
                    "[TpBuf] complete {}B after {:?} (session=0x{:04x})",
                    complete.payload.len(),
                    buffer.started.elapsed(),
                    key.session_id
                );
                return Ok(Some(complete));
            }
        }
        Ok(None)
    }

    /// Segment sanity independent of buffer state, plus cross-segment
    /// consistency with an existing buffer.
    fn validate_segment(
        &self,
        key: &ReassemblyKey,
        header: &TpHeader,
        start: usize,
        end: usize,
    ) -> Result<()> {
        if end > self.cfg.max_message_size {
            return Err(Error::Resource(ResourceError::MessageTooLarge {
                size: end,
                max: self.cfg.max_message_size,
            }));
        }
        if let Some(buffer) = self.pending.get(key) {
            if let Some(total) = buffer.total {
                // Conflicting totals or bytes past a fixed end.
                if (!header.more_segments && end != total) || end > total {
                    return Err(Error::Protocol(ProtocolError::InvalidSegment));
                }
            }
        }
        Ok(())
    }

    /// Drop buffers whose last progress is older than the timeout.
    /// Called by the periodic sweep; returns how many were dropped.
    pub fn evict_expired(&mut self) -> usize {
        let timeout = self.cfg.reassembly_timeout;
        let before = self.pending.len();
        self.pending.retain(|key, buffer| {
            let stalled = buffer.last_progress.elapsed() > timeout;
            if stalled {
                log::debug!(
                    "[TpBuf] timeout evict session=0x{:04x} covered={:?} total={:?}",
                    key.session_id,
                    buffer.covered,
                    buffer.total
                );
            }
            !stalled
        });
        let evicted = before - self.pending.len();
        self.stats.expired += evicted as u64;
        evicted
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{MessageId, MessageType, RequestId};
    use crate::tp::segment::segment_message;
    use std::time::Duration;

    fn source(len: usize, session: u16) -> Message {
        Message::new(
            MessageId::new(0x1000, 0x0001),
            RequestId::new(0x1234, session),
            MessageType::Request,
            (0..len).map(|i| (i % 251) as u8).collect(),
        )
    }

    fn cfg() -> TpConfig {
        TpConfig::default()
    }

    #[test]
    fn in_order_reassembly_restores_payload() {
        let msg = source(5000, 1);
        let segments = segment_message(&msg, &cfg()).unwrap();
        let mut r = Reassembler::new(cfg());

        let mut result = None;
        for seg in &segments {
            result = r.insert(seg).unwrap();
        }
        let complete = result.expect("last segment completes the message");
        assert_eq!(complete.payload, msg.payload);
        assert_eq!(complete.message_type, MessageType::Request);
        assert_eq!(complete.request_id, msg.request_id);
        assert_eq!(r.pending_count(), 0);
        assert_eq!(r.stats().completed, 1);
    }

    #[test]
    fn out_of_order_with_duplicates_matches_in_order() {
        let msg = source(5000, 2);
        let segments = segment_message(&msg, &cfg()).unwrap();
        let mut r = Reassembler::new(cfg());

        let order = [3usize, 1, 1, 0, 3, 2];
        let mut complete = None;
        for &i in &order {
            if let Some(done) = r.insert(&segments[i]).unwrap() {
                complete = Some(done);
            }
        }
        assert_eq!(complete.unwrap().payload, msg.payload);
        assert_eq!(r.stats().duplicate_segments, 2);
    }

    #[test]
    fn completion_is_delivered_exactly_once() {
        let msg = source(3000, 3);
        let segments = segment_message(&msg, &cfg()).unwrap();
        let mut r = Reassembler::new(cfg());

        let mut completions = 0;
        for seg in &segments {
            if r.insert(seg).unwrap().is_some() {
                completions += 1;
            }
        }
        // Replaying a segment after completion starts a fresh buffer
        // rather than re-delivering.
        assert!(r.insert(&segments[0]).unwrap().is_none());
        assert_eq!(completions, 1);
    }

    #[test]
    fn interleaved_transfers_stay_independent() {
        let a = source(3000, 10);
        let b = source(4000, 11);
        let segs_a = segment_message(&a, &cfg()).unwrap();
        let segs_b = segment_message(&b, &cfg()).unwrap();
        let mut r = Reassembler::new(cfg());

        r.insert(&segs_a[0]).unwrap();
        r.insert(&segs_b[0]).unwrap();
        r.insert(&segs_b[1]).unwrap();
        r.insert(&segs_a[1]).unwrap();
        let done_a = r.insert(&segs_a[2]).unwrap().unwrap();
        let done_b = r.insert(&segs_b[2]).unwrap().unwrap();
        assert_eq!(done_a.payload, a.payload);
        assert_eq!(done_b.payload, b.payload);
    }

    #[test]
    fn segment_past_fixed_total_aborts_only_that_buffer() {
        let msg = source(3000, 20);
        let other = source(3000, 21);
        let segments = segment_message(&msg, &cfg()).unwrap();
        let mut r = Reassembler::new(cfg());

        r.insert(&segments[0]).unwrap();
        r.insert(&segments[2]).unwrap(); // LAST fixes total at 3000
        r.insert(&segment_message(&other, &cfg()).unwrap()[0]).unwrap();

        // Forge a segment claiming bytes past the fixed total.
        let mut forged = segments[1].clone();
        let mut payload = TpHeader::new(2900, true).encode().to_vec();
        payload.extend_from_slice(&[0u8; 1400]);
        forged.payload = payload;

        let err = r.insert(&forged).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidSegment)));
        // The other key survives.
        assert_eq!(r.pending_count(), 1);
        // And the same key restarts cleanly.
        assert!(r.insert(&segments[0]).unwrap().is_none());
    }

    #[test]
    fn conflicting_totals_abort() {
        let msg = source(3000, 30);
        let segments = segment_message(&msg, &cfg()).unwrap();
        let mut r = Reassembler::new(cfg());
        r.insert(&segments[2]).unwrap(); // LAST: total = 3000

        // A second LAST claiming a different total.
        let mut forged = segments[2].clone();
        let mut payload = TpHeader::new(2800, false).encode().to_vec();
        payload.extend_from_slice(&[0u8; 100]);
        forged.payload = payload;

        assert!(r.insert(&forged).is_err());
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn claim_past_max_message_size_refused_before_allocating() {
        let mut r = Reassembler::new(cfg());
        let mut msg = source(0, 40);
        msg.message_type = MessageType::TpRequest;
        let mut payload = TpHeader::new(0x0FFF_FFF0, true).encode().to_vec();
        payload.extend_from_slice(&[0u8; 16]);
        msg.payload = payload;

        let err = r.insert(&msg).unwrap_err();
        assert!(matches!(
            err,
            Error::Resource(ResourceError::MessageTooLarge { .. })
        ));
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn transfer_cap_is_enforced() {
        let cfg = TpConfig {
            max_concurrent_transfers: 2,
            ..TpConfig::default()
        };
        let mut r = Reassembler::new(cfg.clone());
        for session in 1..=2 {
            let segs = segment_message(&source(3000, session), &cfg).unwrap();
            r.insert(&segs[0]).unwrap();
        }
        let segs = segment_message(&source(3000, 3), &cfg).unwrap();
        let err = r.insert(&segs[0]).unwrap_err();
        assert!(matches!(
            err,
            Error::Resource(ResourceError::TransfersExhausted)
        ));
    }

    #[test]
    fn stalled_buffer_is_evicted_and_key_restarts() {
        let cfg = TpConfig {
            reassembly_timeout: Duration::from_millis(50),
            ..TpConfig::default()
        };
        let msg = source(3000, 50);
        let segments = segment_message(&msg, &cfg).unwrap();
        let mut r = Reassembler::new(cfg);

        r.insert(&segments[0]).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(r.evict_expired(), 1);
        assert_eq!(r.pending_count(), 0);
        assert_eq!(r.stats().expired, 1);

        // Fresh start on the same key completes normally.
        for seg in &segments[..2] {
            r.insert(seg).unwrap();
        }
        let done = r.insert(&segments[2]).unwrap().unwrap();
        assert_eq!(done.payload, msg.payload);
    }

    #[test]
    fn non_tp_message_is_rejected() {
        let mut r = Reassembler::new(cfg());
        let err = r.insert(&source(10, 60)).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidSegment)));
    }
}
