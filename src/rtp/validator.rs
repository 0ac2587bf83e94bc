//! Stateful RTP stream validation.

use crate::{
    constants::{DEFAULT_MAX_SN_JUMP, DEFAULT_MAX_TS_JUMP},
    packet::{seq_diff, ts_diff, PacketPtr, PacketReader, RtpHeader},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::warn;

/// Session kill-switch shared between deep pipeline stages and the
/// session that owns them.
///
/// Stages trip it when they observe a terminal condition; the session's
/// `update` surfaces the trip to the dispatcher.
#[derive(Debug, Default)]
pub struct Breaker {
    tripped: AtomicBool,
}

impl Breaker {
    /// Fresh, untripped breaker.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Latch the terminal state.
    pub fn trip(&self) {
        self.tripped.store(true, Ordering::Release);
    }

    /// Whether any stage has declared the session dead.
    #[must_use]
    pub fn tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }
}

/// Limits on inter-packet jumps before a stream is declared broken.
#[derive(Clone, Copy, Debug)]
pub struct ValidatorConfig {
    /// Largest accepted distance between consecutive sequence numbers.
    pub max_sn_jump: u16,
    /// Largest accepted distance between consecutive timestamps, samples.
    pub max_ts_jump: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_sn_jump: DEFAULT_MAX_SN_JUMP,
            max_ts_jump: DEFAULT_MAX_TS_JUMP,
        }
    }
}

/// Rejects packets that violate per-session RTP invariants.
///
/// Rejection is terminal: the breaker is tripped and the reader goes
/// silent, leaving teardown to the dispatcher. A fresh session picks up
/// the stream on the next packet from the (possibly new) source.
pub struct Validator {
    reader: Box<dyn PacketReader>,
    payload_type: u8,
    config: ValidatorConfig,
    breaker: Arc<Breaker>,
    last: Option<RtpHeader>,
}

impl Validator {
    /// Wrap `reader`, enforcing `payload_type` and `config` limits.
    #[must_use]
    pub fn new(
        reader: Box<dyn PacketReader>,
        payload_type: u8,
        config: ValidatorConfig,
        breaker: Arc<Breaker>,
    ) -> Self {
        Self {
            reader,
            payload_type,
            config,
            breaker,
            last: None,
        }
    }

    fn validate(&self, rtp: &RtpHeader) -> bool {
        if rtp.payload_type != self.payload_type {
            warn!(
                "payload type changed mid-stream: {} -> {}",
                self.payload_type, rtp.payload_type,
            );
            return false;
        }

        let Some(last) = &self.last else {
            return true;
        };

        if rtp.source != last.source {
            warn!("source id changed mid-stream: {} -> {}", last.source, rtp.source);
            return false;
        }

        let sn_jump = seq_diff(rtp.seqnum, last.seqnum).unsigned_abs();
        if sn_jump > self.config.max_sn_jump {
            warn!("sequence jump too large: {sn_jump}");
            return false;
        }

        let ts_jump = ts_diff(rtp.timestamp, last.timestamp).unsigned_abs();
        if ts_jump > self.config.max_ts_jump {
            warn!("timestamp jump too large: {ts_jump}");
            return false;
        }

        true
    }
}

impl PacketReader for Validator {
    fn read(&mut self) -> Option<PacketPtr> {
        if self.breaker.tripped() {
            return None;
        }

        let packet = self.reader.read()?;

        let Some(rtp) = packet.rtp() else {
            warn!("non-rtp packet reached the validator");
            self.breaker.trip();
            return None;
        };

        if !self.validate(rtp) {
            self.breaker.trip();
            return None;
        }

        self.last = Some(*rtp);
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, PacketFlags, SortedQueue};
    use bytes::Bytes;
    use std::sync::Arc;

    fn packet(source: u32, seqnum: u16, timestamp: u32, payload_type: u8) -> PacketPtr {
        Packet::new(
            PacketFlags::AUDIO,
            Some(RtpHeader {
                source,
                seqnum,
                timestamp,
                payload_type,
                marker: false,
            }),
            None,
            Bytes::new(),
            Bytes::new(),
            "127.0.0.1:4000".parse().unwrap(),
        )
    }

    fn validator(queue: &Arc<SortedQueue>, breaker: &Arc<Breaker>) -> Validator {
        Validator::new(
            Box::new(Arc::clone(queue)),
            96,
            ValidatorConfig::default(),
            Arc::clone(breaker),
        )
    }

    #[test]
    fn passes_well_formed_stream() {
        let queue = SortedQueue::new(None);
        let breaker = Breaker::new();
        let mut v = validator(&queue, &breaker);

        for i in 0..4u16 {
            queue.push(packet(1, i, u32::from(i) * 320, 96));
        }
        for _ in 0..4 {
            assert!(v.read().is_some());
        }
        assert!(!breaker.tripped());
    }

    #[test]
    fn source_change_is_terminal() {
        let queue = SortedQueue::new(None);
        let breaker = Breaker::new();
        let mut v = validator(&queue, &breaker);

        queue.push(packet(1, 0, 0, 96));
        assert!(v.read().is_some());

        queue.push(packet(2, 1, 320, 96));
        assert!(v.read().is_none());
        assert!(breaker.tripped());

        // Dead forever, even for valid input.
        queue.push(packet(1, 2, 640, 96));
        assert!(v.read().is_none());
    }

    #[test]
    fn sequence_jump_is_terminal() {
        let queue = SortedQueue::new(None);
        let breaker = Breaker::new();
        let mut v = validator(&queue, &breaker);

        queue.push(packet(1, 0, 0, 96));
        assert!(v.read().is_some());

        queue.push(packet(1, 500, 320, 96));
        assert!(v.read().is_none());
        assert!(breaker.tripped());
    }

    #[test]
    fn wrong_payload_type_is_terminal() {
        let queue = SortedQueue::new(None);
        let breaker = Breaker::new();
        let mut v = validator(&queue, &breaker);

        queue.push(packet(1, 0, 0, 97));
        assert!(v.read().is_none());
        assert!(breaker.tripped());
    }
}
