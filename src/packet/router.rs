//! Flag-based dispatch of ingress packets onto per-stream queues.

use super::{PacketFlags, PacketPtr, SortedQueue};
use std::sync::Arc;
use tracing::trace;

/// Routes each incoming packet to the first queue whose flags it carries.
///
/// A session registers its source queue under [`PacketFlags::AUDIO`] and,
/// when FEC is on, its repair queue under [`PacketFlags::REPAIR`].
#[derive(Debug, Default)]
pub struct Router {
    routes: Vec<(PacketFlags, Arc<SortedQueue>)>,
}

impl Router {
    /// Empty router; add routes before use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue for packets carrying `flags`.
    pub fn add_route(&mut self, flags: PacketFlags, queue: Arc<SortedQueue>) {
        self.routes.push((flags, queue));
    }

    /// Dispatch one packet; unroutable packets are dropped.
    pub fn write(&self, packet: PacketPtr) {
        for (flags, queue) in &self.routes {
            if packet.has_flags(*flags) {
                queue.push(packet);
                return;
            }
        }
        trace!("no route for packet flags {:?}", packet.flags());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{FecMeta, Packet, RtpHeader};
    use bytes::Bytes;

    fn source_packet(seqnum: u16) -> PacketPtr {
        Packet::new(
            PacketFlags::AUDIO,
            Some(RtpHeader {
                source: 1,
                seqnum,
                timestamp: 0,
                payload_type: 96,
                marker: false,
            }),
            None,
            Bytes::new(),
            Bytes::new(),
            "127.0.0.1:4000".parse().unwrap(),
        )
    }

    fn repair_packet(esi: u16) -> PacketPtr {
        Packet::new(
            PacketFlags::REPAIR.with(PacketFlags::FEC),
            None,
            Some(FecMeta {
                sbn: 0,
                sblen: 4,
                esi,
            }),
            Bytes::new(),
            Bytes::new(),
            "127.0.0.1:4001".parse().unwrap(),
        )
    }

    #[test]
    fn routes_by_flag() {
        let source = SortedQueue::new(None);
        let repair = SortedQueue::new(None);

        let mut router = Router::new();
        router.add_route(PacketFlags::AUDIO, Arc::clone(&source));
        router.add_route(PacketFlags::REPAIR, Arc::clone(&repair));

        router.write(source_packet(1));
        router.write(repair_packet(4));
        router.write(source_packet(2));

        assert_eq!(source.len(), 2);
        assert_eq!(repair.len(), 1);
    }
}
