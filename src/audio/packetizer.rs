//! Sample stream to packet stream conversion (sender side).

use super::Sample;
use crate::{
    packet::{Packet, PacketFlags, PacketWriter, RtpHeader},
    rtp::encode_l16,
};
use bytes::Bytes;
use rand::random;
use std::net::SocketAddr;

/// Chops the outgoing sample stream into fixed-duration RTP packets.
///
/// Sequence numbers, the initial timestamp, and the source id start at
/// random values, like any self-respecting RTP origin. The marker bit is
/// set on the first packet of the stream only.
pub struct Packetizer {
    writer: Box<dyn PacketWriter>,
    payload_type: u8,
    channels: usize,
    samples_per_packet: usize,
    addr: SocketAddr,

    source: u32,
    seqnum: u16,
    timestamp: u32,
    first: bool,

    buffer: Vec<Sample>,
}

impl Packetizer {
    /// Build a packetizer emitting into `writer`.
    #[must_use]
    pub fn new(
        writer: Box<dyn PacketWriter>,
        payload_type: u8,
        channels: usize,
        samples_per_packet: usize,
        addr: SocketAddr,
    ) -> Self {
        Self {
            writer,
            payload_type,
            channels,
            samples_per_packet,
            addr,
            source: random(),
            seqnum: random(),
            timestamp: random(),
            first: true,
            buffer: Vec::new(),
        }
    }

    /// Stream source id, fixed for the lifetime of the packetizer.
    #[must_use]
    pub fn source(&self) -> u32 {
        self.source
    }

    /// Append interleaved samples, flushing every full packet.
    pub fn write(&mut self, samples: &[Sample]) {
        self.buffer.extend_from_slice(samples);

        let packet_len = self.samples_per_packet * self.channels;
        while self.buffer.len() >= packet_len {
            let rest = self.buffer.split_off(packet_len);
            let chunk = std::mem::replace(&mut self.buffer, rest);

            let mut payload = Vec::with_capacity(packet_len * 2);
            encode_l16(&chunk, &mut payload);

            let header = RtpHeader {
                source: self.source,
                seqnum: self.seqnum,
                timestamp: self.timestamp,
                payload_type: self.payload_type,
                marker: self.first,
            };
            self.first = false;
            self.seqnum = self.seqnum.wrapping_add(1);
            self.timestamp = self.timestamp.wrapping_add(self.samples_per_packet as u32);

            let packet = Packet::new(
                PacketFlags::AUDIO,
                Some(header),
                None,
                Bytes::new(),
                Bytes::from(payload),
                self.addr,
            );
            self.writer.write(packet);
        }
    }
}
