//! Block disassembly: annotates outgoing source packets with FEC
//! metadata and interleaves freshly encoded repair packets.

use super::{BlockEncoder, FecConfig};
use crate::packet::{
    blk_next, Blknum, Composer, FecMeta, Packet, PacketFlags, PacketPtr, PacketWriter,
};
use rand::random;
use std::net::SocketAddr;
use tracing::{error, trace};

/// Drives a [`BlockEncoder`] over the outgoing source stream.
///
/// Every incoming packet becomes one composed source datagram; when a
/// block fills up, its repair datagrams follow immediately, before the
/// next block's first source packet. The receiver relies on that
/// ordering to decide when a block is beyond saving.
pub struct FecWriter {
    encoder: Box<dyn BlockEncoder>,
    writer: Box<dyn PacketWriter>,
    source_composer: Composer,
    repair_composer: Composer,
    payload_size: usize,
    cur_sblen: usize,
    next_sblen: usize,
    rblen: usize,
    cur_sbn: Blknum,
    cur_packet: usize,
    block_ok: bool,
    source_addr: SocketAddr,
    repair_addr: SocketAddr,
}

impl FecWriter {
    /// Wrap `writer`; composed datagrams for both sub-streams flow into
    /// it, tagged by packet flags. Starts at a random block number so
    /// that restarted senders do not collide with stale state.
    #[must_use]
    pub fn new(
        config: &FecConfig,
        encoder: Box<dyn BlockEncoder>,
        writer: Box<dyn PacketWriter>,
        source_addr: SocketAddr,
        repair_addr: SocketAddr,
    ) -> Self {
        let scheme = config.scheme;
        Self {
            encoder,
            writer,
            source_composer: Composer::new(scheme.source_protocol()),
            repair_composer: Composer::new(scheme.repair_protocol()),
            payload_size: config.payload_size,
            cur_sblen: config.n_source_packets,
            next_sblen: config.n_source_packets,
            rblen: config.n_repair_packets,
            cur_sbn: random::<u32>() & crate::packet::BLKNUM_MASK,
            cur_packet: 0,
            block_ok: false,
            source_addr,
            repair_addr,
        }
    }

    /// Change the source block length, applied at the next block
    /// boundary.
    pub fn resize(&mut self, sblen: usize) {
        trace!("fec writer: resize {} -> {}", self.cur_sblen, sblen);
        self.next_sblen = sblen;
    }

    fn finish_block(&mut self) {
        if self.block_ok {
            self.encoder.fill();
            for i in 0..self.rblen {
                let meta = FecMeta {
                    sbn: self.cur_sbn,
                    sblen: self.cur_sblen,
                    esi: (self.cur_sblen + i) as u16,
                };
                let Some(symbol) = self.encoder.repair(self.cur_sblen + i) else {
                    error!("fec writer: no repair symbol at {i}");
                    continue;
                };
                let wire = self.repair_composer.compose_repair(&meta, &symbol);
                let packet = Packet::new(
                    PacketFlags::REPAIR
                        .with(PacketFlags::FEC)
                        .with(PacketFlags::COMPOSED),
                    None,
                    Some(meta),
                    wire,
                    symbol,
                    self.repair_addr,
                );
                self.writer.write(packet);
            }
            self.encoder.end();
        }

        self.cur_sbn = blk_next(self.cur_sbn);
        self.cur_packet = 0;
        self.cur_sblen = self.next_sblen;
    }
}

impl PacketWriter for FecWriter {
    fn write(&mut self, packet: PacketPtr) {
        let rtp = *packet
            .rtp()
            .expect("fec writer: unexpected non-rtp packet");

        if self.cur_packet == 0 {
            self.block_ok = self.encoder.begin(self.cur_sblen, self.rblen);
            if !self.block_ok {
                error!("fec writer: cannot begin block, sending unprotected");
            }
        }

        let meta = FecMeta {
            sbn: self.cur_sbn,
            sblen: self.cur_sblen,
            esi: self.cur_packet as u16,
        };
        let wire = self
            .source_composer
            .compose_source(&rtp, Some(&meta), &packet.payload());
        assert_eq!(
            wire.len(),
            self.payload_size,
            "fec writer: variable-size source packet",
        );

        let composed = Packet::new(
            packet
                .flags()
                .with(PacketFlags::FEC)
                .with(PacketFlags::COMPOSED),
            Some(rtp),
            Some(meta),
            wire.clone(),
            packet.payload(),
            self.source_addr,
        );

        if self.block_ok {
            self.encoder.set(self.cur_packet, wire);
        }
        self.writer.write(composed);

        self.cur_packet += 1;
        if self.cur_packet == self.cur_sblen {
            self.finish_block();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::Pool,
        constants::{PAYLOAD_ID_SIZE, RTP_HEADER_SIZE},
        fec::{new_decoder, new_encoder, FecReader},
        packet::{PacketReader, Parser, RtpHeader, SortedQueue},
    };
    use bytes::Bytes;
    use std::sync::Arc;

    const AUDIO_LEN: usize = 40;
    const PAYLOAD_SIZE: usize = RTP_HEADER_SIZE + PAYLOAD_ID_SIZE + AUDIO_LEN;
    const SBLEN: usize = 4;
    const RBLEN: usize = 2;

    struct ChannelWriter(flume::Sender<PacketPtr>);

    impl PacketWriter for ChannelWriter {
        fn write(&mut self, packet: PacketPtr) {
            let _ = self.0.send(packet);
        }
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn config() -> FecConfig {
        FecConfig {
            payload_size: PAYLOAD_SIZE,
            n_source_packets: SBLEN,
            n_repair_packets: RBLEN,
            ..FecConfig::default()
        }
    }

    fn source_packet(seqnum: u16) -> PacketPtr {
        let audio: Vec<u8> = (0..AUDIO_LEN).map(|j| (j as u8) ^ (seqnum as u8)).collect();
        Packet::new(
            PacketFlags::AUDIO,
            Some(RtpHeader {
                source: 0xabcd,
                seqnum,
                timestamp: u32::from(seqnum) * 10,
                payload_type: 96,
                marker: false,
            }),
            None,
            Bytes::new(),
            Bytes::from(audio),
            addr(9000),
        )
    }

    #[test]
    fn emits_repair_after_each_block() {
        let (tx, rx) = flume::unbounded();
        let cfg = config();
        let encoder = new_encoder(&cfg, Pool::new(PAYLOAD_SIZE, 16)).unwrap();
        let mut writer =
            FecWriter::new(&cfg, encoder, Box::new(ChannelWriter(tx)), addr(9000), addr(9001));

        for seq in 0..(2 * SBLEN as u16) {
            writer.write(source_packet(seq));
        }

        let out: Vec<PacketPtr> = rx.drain().collect();
        assert_eq!(out.len(), 2 * (SBLEN + RBLEN));

        // Per block: sblen composed sources, then rblen repairs.
        for block in out.chunks(SBLEN + RBLEN) {
            for (i, p) in block.iter().enumerate() {
                let meta = p.fec().unwrap();
                assert_eq!(meta.esi as usize, i);
                assert_eq!(meta.sblen, SBLEN);
                assert_eq!(p.has_flags(PacketFlags::REPAIR), i >= SBLEN);
                assert!(p.has_flags(PacketFlags::COMPOSED));
            }
            let sbn = block[0].fec().unwrap().sbn;
            assert!(block.iter().all(|p| p.fec().unwrap().sbn == sbn));
        }

        let (b0, b1) = (out[0].fec().unwrap().sbn, out[SBLEN + RBLEN].fec().unwrap().sbn);
        assert_eq!(b1, blk_next(b0));
    }

    #[test]
    fn wire_loopback_recovers_losses() {
        let (tx, rx) = flume::unbounded();
        let cfg = config();
        let encoder = new_encoder(&cfg, Pool::new(PAYLOAD_SIZE, 16)).unwrap();
        let mut writer =
            FecWriter::new(&cfg, encoder, Box::new(ChannelWriter(tx)), addr(9000), addr(9001));

        let originals: Vec<PacketPtr> = (0..SBLEN as u16).map(source_packet).collect();
        for p in &originals {
            writer.write(Arc::clone(p));
        }

        let source_q = SortedQueue::new(None);
        let repair_q = SortedQueue::new(None);
        let source_parser = Parser::new(cfg.scheme.source_protocol());
        let repair_parser = Parser::new(cfg.scheme.repair_protocol());

        // Re-parse the wire images, dropping source packet 2.
        for (i, p) in rx.drain().enumerate() {
            if i == 2 {
                continue;
            }
            let parsed = if p.has_flags(PacketFlags::REPAIR) {
                repair_parser.parse(p.data(), addr(9001)).unwrap()
            } else {
                source_parser.parse(p.data(), addr(9000)).unwrap()
            };
            if parsed.has_flags(PacketFlags::REPAIR) {
                repair_q.push(parsed);
            } else {
                source_q.push(parsed);
            }
        }

        let decoder = new_decoder(&cfg, Pool::new(PAYLOAD_SIZE, 16)).unwrap();
        let mut fec = FecReader::new(
            &cfg,
            decoder,
            Box::new(Arc::clone(&source_q)),
            Box::new(Arc::clone(&repair_q)),
            source_parser,
            addr(9000),
        );

        let out: Vec<PacketPtr> = std::iter::from_fn(|| fec.read()).collect();
        assert_eq!(out.len(), SBLEN);
        for (got, want) in out.iter().zip(&originals) {
            assert_eq!(got.rtp().unwrap(), want.rtp().unwrap());
            assert_eq!(got.payload(), want.payload());
        }
    }
}
