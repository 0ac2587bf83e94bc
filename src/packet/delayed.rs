//! Start-of-stream latency accumulator.

use super::{ts_diff, PacketPtr, PacketReader};
use std::collections::VecDeque;
use tracing::debug;

/// Withholds packets until a target span of audio is buffered, then gets
/// out of the way for good.
///
/// The span is measured between the timestamp of the earliest held packet
/// and the end of the latest one, so a single fat packet can also trip
/// the threshold. The transition is one-way; a later underrun never
/// causes re-buffering here (that is the latency monitor's job).
pub struct DelayedReader {
    reader: Box<dyn PacketReader>,
    held: VecDeque<PacketPtr>,
    target_latency: u32,
    channels: usize,
    started: bool,
}

impl DelayedReader {
    /// Wrap `reader`, releasing packets once `target_latency` samples
    /// separate the earliest and latest held packets.
    #[must_use]
    pub fn new(reader: Box<dyn PacketReader>, target_latency: u32, channels: usize) -> Self {
        Self {
            reader,
            held: VecDeque::new(),
            target_latency,
            channels,
            started: false,
        }
    }

    fn buffered_span(&self) -> u32 {
        let (Some(head), Some(tail)) = (self.held.front(), self.held.back()) else {
            return 0;
        };
        let (Some(h), Some(t)) = (head.rtp(), tail.rtp()) else {
            return 0;
        };

        let span = ts_diff(t.timestamp.wrapping_add(tail.duration(self.channels)), h.timestamp);
        span.max(0) as u32
    }
}

impl PacketReader for DelayedReader {
    fn read(&mut self) -> Option<PacketPtr> {
        if self.started {
            if let Some(held) = self.held.pop_front() {
                return Some(held);
            }
            return self.reader.read();
        }

        while let Some(packet) = self.reader.read() {
            self.held.push_back(packet);
        }

        if self.buffered_span() >= self.target_latency {
            debug!(
                "initial latency reached: {} packets / {} samples",
                self.held.len(),
                self.buffered_span(),
            );
            self.started = true;
            return self.held.pop_front();
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, PacketFlags, RtpHeader, SortedQueue};
    use bytes::Bytes;
    use std::sync::Arc;

    const SPP: u32 = 320;

    fn packet(seqnum: u16, timestamp: u32) -> PacketPtr {
        Packet::new(
            PacketFlags::AUDIO,
            Some(RtpHeader {
                source: 1,
                seqnum,
                timestamp,
                payload_type: 96,
                marker: false,
            }),
            None,
            Bytes::new(),
            // 320 stereo samples of 16-bit audio
            Bytes::from(vec![0u8; SPP as usize * 2 * 2]),
            "127.0.0.1:4000".parse().unwrap(),
        )
    }

    #[test]
    fn holds_until_target_then_forwards() {
        let queue = SortedQueue::new(None);
        let mut delayed = DelayedReader::new(Box::new(Arc::clone(&queue)), 4 * SPP, 2);

        for i in 0..3u16 {
            queue.push(packet(i, u32::from(i) * SPP));
        }
        // 3 packets = 960 samples < 1280 target
        assert!(delayed.read().is_none());

        queue.push(packet(3, 3 * SPP));
        // 4 packets = 1280 samples: released in order
        for i in 0..4u16 {
            assert_eq!(delayed.read().unwrap().rtp().unwrap().seqnum, i);
        }
        assert!(delayed.read().is_none());

        // Transparent afterwards, even when the buffer is shallow.
        queue.push(packet(4, 4 * SPP));
        assert_eq!(delayed.read().unwrap().rtp().unwrap().seqnum, 4);
    }
}
