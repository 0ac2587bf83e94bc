//! Ingress parsing: one UDP datagram in, one [`Packet`] out.

use super::{FecMeta, Packet, PacketFlags, PacketPtr, RtpHeader, BLKNUM_MASK};
use crate::constants::{PAYLOAD_ID_SIZE, RTP_HEADER_SIZE, RTP_VERSION};
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use discortp::rtp::RtpPacket;
use std::net::SocketAddr;
use tracing::trace;

/// Wire layout of a bound port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Protocol {
    /// Plain RTP, no FEC metadata.
    Rtp,
    /// RTP source packets with a Reed-Solomon payload ID after the header.
    RtpRsSource,
    /// Raw Reed-Solomon repair packets, payload ID first.
    RsRepair,
    /// RTP source packets with an LDPC payload ID after the header.
    RtpLdpcSource,
    /// Raw LDPC repair packets, payload ID last.
    LdpcRepair,
}

impl Protocol {
    /// Whether packets of this protocol carry a payload ID at all.
    #[must_use]
    pub fn is_fec(self) -> bool {
        !matches!(self, Protocol::Rtp)
    }

    /// Whether this is a repair sub-stream.
    #[must_use]
    pub fn is_repair(self) -> bool {
        matches!(self, Protocol::RsRepair | Protocol::LdpcRepair)
    }
}

/// Decode a FECFRAME payload ID from `buf` (8 bytes, big-endian).
#[must_use]
pub fn read_payload_id(buf: &[u8]) -> FecMeta {
    FecMeta {
        sbn: BigEndian::read_u32(&buf[0..4]) & BLKNUM_MASK,
        sblen: BigEndian::read_u16(&buf[4..6]) as usize,
        esi: BigEndian::read_u16(&buf[6..8]),
    }
}

/// Encode a FECFRAME payload ID into `buf` (8 bytes, big-endian).
pub fn write_payload_id(buf: &mut [u8], meta: &FecMeta) {
    BigEndian::write_u32(&mut buf[0..4], meta.sbn & BLKNUM_MASK);
    BigEndian::write_u16(&mut buf[4..6], meta.sblen as u16);
    BigEndian::write_u16(&mut buf[6..8], meta.esi);
}

/// Stateless datagram parser for one bound port.
#[derive(Clone, Copy, Debug)]
pub struct Parser {
    protocol: Protocol,
}

impl Parser {
    /// Build a parser for the given wire layout.
    #[must_use]
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    /// Parse one datagram. Malformed input yields `None`; the caller is
    /// expected to count and drop.
    #[must_use]
    pub fn parse(&self, data: Bytes, addr: SocketAddr) -> Option<PacketPtr> {
        match self.protocol {
            Protocol::Rtp => self.parse_rtp(data, addr, false),
            Protocol::RtpRsSource | Protocol::RtpLdpcSource => self.parse_rtp(data, addr, true),
            Protocol::RsRepair => self.parse_repair(data, addr, false),
            Protocol::LdpcRepair => self.parse_repair(data, addr, true),
        }
    }

    fn parse_rtp(&self, data: Bytes, addr: SocketAddr, fec: bool) -> Option<PacketPtr> {
        let rtp = RtpPacket::new(&data)?;
        if rtp.get_version() != RTP_VERSION {
            trace!("dropping datagram with RTP version {}", rtp.get_version());
            return None;
        }

        let seqnum: u16 = rtp.get_sequence().0 .0;
        let timestamp: u32 = rtp.get_timestamp().0 .0;
        let source = rtp.get_ssrc();

        // Payload type and marker share the second byte; the CSRC count
        // widens the header beyond the 12-byte minimum.
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let csrc_len = 4 * (data[0] & 0x0f) as usize;
        let padding = if data[0] & 0x20 != 0 {
            *data.last()? as usize
        } else {
            0
        };

        let mut offset = RTP_HEADER_SIZE + csrc_len;
        let mut flags = PacketFlags::AUDIO;
        let mut meta = None;

        if fec {
            if data.len() < offset + PAYLOAD_ID_SIZE {
                trace!("dropping source datagram too short for payload id");
                return None;
            }
            meta = Some(read_payload_id(&data[offset..offset + PAYLOAD_ID_SIZE]));
            offset += PAYLOAD_ID_SIZE;
            flags = flags.with(PacketFlags::FEC);
        }

        let end = data.len().checked_sub(padding)?;
        if end < offset {
            trace!("dropping datagram with short payload");
            return None;
        }

        let payload = data.slice(offset..end);
        let header = RtpHeader {
            source,
            seqnum,
            timestamp,
            payload_type,
            marker,
        };

        Some(Packet::new(flags, Some(header), meta, data, payload, addr))
    }

    fn parse_repair(&self, data: Bytes, addr: SocketAddr, footer: bool) -> Option<PacketPtr> {
        if data.len() <= PAYLOAD_ID_SIZE {
            trace!("dropping repair datagram too short for payload id");
            return None;
        }

        let (meta, payload) = if footer {
            let split = data.len() - PAYLOAD_ID_SIZE;
            (read_payload_id(&data[split..]), data.slice(..split))
        } else {
            (
                read_payload_id(&data[..PAYLOAD_ID_SIZE]),
                data.slice(PAYLOAD_ID_SIZE..),
            )
        };

        let flags = PacketFlags::REPAIR.with(PacketFlags::FEC);

        Some(Packet::new(flags, None, Some(meta), data, payload, addr))
    }
}
