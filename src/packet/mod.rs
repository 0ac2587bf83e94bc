//! Packet model shared by every pipeline stage.
//!
//! A [`Packet`] is parsed once at ingress and then shared read-only by
//! pointer between stages; the sorted queues, the FEC reader, and the
//! depacketizer all hold [`PacketPtr`] clones of the same allocation.

mod compose;
mod delayed;
mod parse;
mod queue;
mod router;

pub use self::{
    compose::Composer,
    delayed::DelayedReader,
    parse::{read_payload_id, write_payload_id, Parser, Protocol},
    queue::SortedQueue,
    router::Router,
};

use bytes::Bytes;
use std::{cmp::Ordering, net::SocketAddr, sync::Arc};

/// RTP sequence number, wrapping on 16 bits.
pub type Seqnum = u16;

/// RTP timestamp, wrapping on 32 bits and indexed in samples.
pub type Timestamp = u32;

/// FECFRAME source block number, wrapping on 24 bits.
pub type Blknum = u32;

/// RTP synchronisation source identifier.
pub type SourceId = u32;

/// Shared handle to an immutable parsed packet.
pub type PacketPtr = Arc<Packet>;

/// Mask of valid source block numbers.
pub const BLKNUM_MASK: u32 = 0x00ff_ffff;

/// Bit flags describing a packet's role in the pipeline.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Packet carries decodable audio samples.
    pub const AUDIO: PacketFlags = PacketFlags(0x01);
    /// Packet carries a repair symbol.
    pub const REPAIR: PacketFlags = PacketFlags(0x02);
    /// Packet participates in a FEC block (has a payload ID).
    pub const FEC: PacketFlags = PacketFlags(0x04);
    /// Packet's wire image has been composed and is ready to transmit.
    pub const COMPOSED: PacketFlags = PacketFlags(0x08);

    /// Combine two flag sets.
    #[must_use]
    pub fn with(self, other: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | other.0)
    }

    /// True if every bit of `other` is present in `self`.
    #[must_use]
    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Parsed RTP header fields.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RtpHeader {
    /// Synchronisation source of the sender.
    pub source: SourceId,
    /// Wrapping sequence number.
    pub seqnum: Seqnum,
    /// Wrapping sample-indexed timestamp.
    pub timestamp: Timestamp,
    /// Payload type, resolved against the format map downstream.
    pub payload_type: u8,
    /// RTP marker bit.
    pub marker: bool,
}

/// Parsed FECFRAME payload ID fields.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FecMeta {
    /// Source block this symbol belongs to.
    pub sbn: Blknum,
    /// Number of source symbols in the block (`k`).
    pub sblen: usize,
    /// Encoding symbol index; `0..sblen` are source positions,
    /// `sblen..` repair positions.
    pub esi: u16,
}

/// An immutable received or composed packet.
#[derive(Clone, Debug)]
pub struct Packet {
    flags: PacketFlags,
    rtp: Option<RtpHeader>,
    fec: Option<FecMeta>,
    /// Complete wire image of the datagram.
    data: Bytes,
    /// Audio payload (source packets) or repair symbol (repair packets).
    payload: Bytes,
    addr: SocketAddr,
}

impl Packet {
    /// Assemble a packet from already-parsed parts. Intended for the
    /// ingress parser, the composers, and tests.
    #[must_use]
    pub fn new(
        flags: PacketFlags,
        rtp: Option<RtpHeader>,
        fec: Option<FecMeta>,
        data: Bytes,
        payload: Bytes,
        addr: SocketAddr,
    ) -> PacketPtr {
        Arc::new(Packet {
            flags,
            rtp,
            fec,
            data,
            payload,
            addr,
        })
    }

    /// Role flags assigned at parse/compose time.
    #[must_use]
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// True if every bit of `flags` is set on this packet.
    #[must_use]
    pub fn has_flags(&self, flags: PacketFlags) -> bool {
        self.flags.contains(flags)
    }

    /// RTP header, absent on raw repair packets.
    #[must_use]
    pub fn rtp(&self) -> Option<&RtpHeader> {
        self.rtp.as_ref()
    }

    /// FECFRAME metadata, absent outside FEC streams.
    #[must_use]
    pub fn fec(&self) -> Option<&FecMeta> {
        self.fec.as_ref()
    }

    /// Complete wire image.
    #[must_use]
    pub fn data(&self) -> Bytes {
        self.data.clone()
    }

    /// Audio payload or repair symbol bytes.
    #[must_use]
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    /// The FEC-protected symbol this packet contributes.
    ///
    /// Source packets are protected whole (header included), so that a
    /// repaired symbol re-parses into an identical packet; repair packets
    /// contribute their raw symbol payload.
    #[must_use]
    pub fn fec_symbol(&self) -> Bytes {
        if self.flags.contains(PacketFlags::REPAIR) {
            self.payload.clone()
        } else {
            self.data.clone()
        }
    }

    /// Remote address the packet arrived from (or is destined to).
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of per-channel samples covered by this packet's payload.
    #[must_use]
    pub fn duration(&self, channels: usize) -> u32 {
        (self.payload.len() / (channels * crate::constants::SAMPLE_BYTE_SIZE)) as u32
    }
}

/// Pull side of a packet stage: yields the next packet when one is ready.
pub trait PacketReader: Send {
    /// Next packet in stream order, or `None` when the stage has nothing
    /// to offer right now. `None` is not terminal.
    fn read(&mut self) -> Option<PacketPtr>;
}

/// Push side of a packet stage.
pub trait PacketWriter: Send {
    /// Hand a packet to the stage. Never blocks.
    fn write(&mut self, packet: PacketPtr);
}

/// Modular "is-after" on 16-bit sequence numbers.
#[inline]
#[must_use]
pub fn seq_is_after(a: Seqnum, b: Seqnum) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

/// Signed distance from `b` to `a` on the 16-bit sequence circle.
#[inline]
#[must_use]
pub fn seq_diff(a: Seqnum, b: Seqnum) -> i16 {
    a.wrapping_sub(b) as i16
}

/// Signed distance from `b` to `a` on the 32-bit timestamp circle.
#[inline]
#[must_use]
pub fn ts_diff(a: Timestamp, b: Timestamp) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Successor of a 24-bit block number.
#[inline]
#[must_use]
pub fn blk_next(b: Blknum) -> Blknum {
    b.wrapping_add(1) & BLKNUM_MASK
}

/// Signed distance from `b` to `a` on the 24-bit block circle.
#[inline]
#[must_use]
pub fn blk_diff(a: Blknum, b: Blknum) -> i32 {
    let d = a.wrapping_sub(b) & BLKNUM_MASK;
    // sign-extend from 24 bits
    ((d << 8) as i32) >> 8
}

/// Modular "is-after" on 24-bit block numbers.
#[inline]
#[must_use]
pub fn blk_is_after(a: Blknum, b: Blknum) -> bool {
    blk_diff(a, b) > 0
}

/// Stream ordering between two packets of the same sub-stream.
///
/// Source packets order by RTP sequence number; raw repair packets order
/// by `(sbn, esi)`. Comparing across sub-streams is a caller bug and
/// falls back to `Equal`.
#[must_use]
pub fn stream_order(a: &Packet, b: &Packet) -> Ordering {
    match (a.rtp(), b.rtp()) {
        (Some(ra), Some(rb)) => {
            let d = seq_diff(ra.seqnum, rb.seqnum);
            d.cmp(&0)
        },
        _ => match (a.fec(), b.fec()) {
            (Some(fa), Some(fb)) => blk_diff(fa.sbn, fb.sbn)
                .cmp(&0)
                .then(fa.esi.cmp(&fb.esi)),
            _ => Ordering::Equal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_order_wraps() {
        assert!(seq_is_after(0x0001, 0xffff));
        assert!(!seq_is_after(0xffff, 0x0001));
        assert_eq!(seq_diff(0x0001, 0xfff0), 17);
        assert_eq!(seq_diff(0xfff0, 0x0001), -17);
    }

    #[test]
    fn blk_order_wraps_on_24_bits() {
        assert!(blk_is_after(0x00_0000, 0xff_ffff));
        assert!(!blk_is_after(0xff_ffff, 0x00_0000));
        assert_eq!(blk_diff(0x00_0002, 0xff_fffe), 4);
        assert_eq!(blk_next(0xff_ffff), 0);
    }

    #[test]
    fn flags_combine() {
        let f = PacketFlags::AUDIO.with(PacketFlags::FEC);
        assert!(f.contains(PacketFlags::AUDIO));
        assert!(f.contains(PacketFlags::FEC));
        assert!(!f.contains(PacketFlags::REPAIR));
    }
}
