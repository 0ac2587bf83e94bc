//! Jitter-absorbing sorted queue, the meeting point of the network push
//! and the audio pull.

use super::{stream_order, PacketPtr, PacketReader};
use parking_lot::Mutex;
use std::{cmp::Ordering, collections::VecDeque, sync::Arc};
use tracing::trace;

/// Priority queue of packets in stream order, duplicate-suppressing.
///
/// Pushes and pops may come from different threads; all state lives
/// behind one uncontended mutex. Depths are small (hundreds), so the
/// reverse linear scan on out-of-order insertion is fine.
#[derive(Debug)]
pub struct SortedQueue {
    max_size: Option<usize>,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    packets: VecDeque<PacketPtr>,
    latest_timestamp: Option<u32>,
}

impl SortedQueue {
    /// Create a queue; `max_size` of `None` means unbounded.
    #[must_use]
    pub fn new(max_size: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            max_size,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Insert a packet in stream order. Exact duplicates and overflow
    /// beyond `max_size` are dropped.
    pub fn push(&self, packet: PacketPtr) {
        let mut inner = self.inner.lock();

        if let Some(max) = self.max_size {
            if inner.packets.len() >= max {
                trace!("sorted queue full, dropping packet");
                return;
            }
        }

        if let Some(rtp) = packet.rtp() {
            match inner.latest_timestamp {
                Some(latest) if super::ts_diff(rtp.timestamp, latest) <= 0 => {},
                _ => inner.latest_timestamp = Some(rtp.timestamp),
            }
        }

        // Fast path: in-order arrival.
        let mut at = inner.packets.len();
        for (i, queued) in inner.packets.iter().enumerate().rev() {
            match stream_order(&packet, queued) {
                Ordering::Greater => {
                    at = i + 1;
                    break;
                },
                Ordering::Equal => {
                    trace!("dropping duplicate packet");
                    return;
                },
                Ordering::Less => at = i,
            }
        }

        inner.packets.insert(at, packet);
    }

    /// Remove and return the earliest packet.
    #[must_use]
    pub fn pop(&self) -> Option<PacketPtr> {
        self.inner.lock().packets.pop_front()
    }

    /// Peek the earliest packet.
    #[must_use]
    pub fn head(&self) -> Option<PacketPtr> {
        self.inner.lock().packets.front().cloned()
    }

    /// Current queue depth.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    /// True when no packets are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest RTP timestamp ever pushed; the queue tail as far as the
    /// latency monitor is concerned. Survives pops so that a drained
    /// queue still reports where the stream got to.
    #[must_use]
    pub fn latest_timestamp(&self) -> Option<u32> {
        self.inner.lock().latest_timestamp
    }
}

impl PacketReader for Arc<SortedQueue> {
    fn read(&mut self) -> Option<PacketPtr> {
        self.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, PacketFlags, RtpHeader};
    use bytes::Bytes;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn rtp_packet(seqnum: u16, timestamp: u32) -> PacketPtr {
        let header = RtpHeader {
            source: 1,
            seqnum,
            timestamp,
            payload_type: 96,
            marker: false,
        };
        Packet::new(
            PacketFlags::AUDIO,
            Some(header),
            None,
            Bytes::new(),
            Bytes::new(),
            addr(),
        )
    }

    #[test]
    fn pops_in_sequence_order() {
        let queue = SortedQueue::new(None);
        for seq in [5u16, 3, 9, 4] {
            queue.push(rtp_packet(seq, u32::from(seq) * 320));
        }

        let order: Vec<u16> = std::iter::from_fn(|| queue.pop())
            .map(|p| p.rtp().unwrap().seqnum)
            .collect();
        assert_eq!(order, vec![3, 4, 5, 9]);
    }

    #[test]
    fn suppresses_duplicates() {
        let queue = SortedQueue::new(None);
        queue.push(rtp_packet(7, 0));
        queue.push(rtp_packet(7, 0));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn orders_across_wrap() {
        let queue = SortedQueue::new(None);
        queue.push(rtp_packet(0x0001, 640));
        queue.push(rtp_packet(0xffff, 0));
        queue.push(rtp_packet(0x0000, 320));

        let order: Vec<u16> = std::iter::from_fn(|| queue.pop())
            .map(|p| p.rtp().unwrap().seqnum)
            .collect();
        assert_eq!(order, vec![0xffff, 0x0000, 0x0001]);
    }

    #[test]
    fn bounded_queue_drops_overflow() {
        let queue = SortedQueue::new(Some(2));
        queue.push(rtp_packet(1, 0));
        queue.push(rtp_packet(2, 320));
        queue.push(rtp_packet(3, 640));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn tracks_latest_timestamp() {
        let queue = SortedQueue::new(None);
        assert_eq!(queue.latest_timestamp(), None);
        queue.push(rtp_packet(1, 320));
        queue.push(rtp_packet(0, 0));
        assert_eq!(queue.latest_timestamp(), Some(320));
        let _ = queue.pop();
        let _ = queue.pop();
        assert_eq!(queue.latest_timestamp(), Some(320));
    }
}
