//! Block assembly: turns two lossy sub-streams (source + repair) into one
//! seamless, in-order source packet stream.

use super::{BlockDecoder, FecConfig};
use crate::packet::{
    blk_diff, blk_next, Blknum, PacketPtr, PacketReader, Parser,
};
use std::{collections::VecDeque, net::SocketAddr};
use tracing::{debug, trace, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SlotStatus {
    Lost,
    Received,
    Repaired,
}

/// Per-session drop/repair counters, logged on block completion.
#[derive(Clone, Copy, Debug, Default)]
pub struct FecStats {
    /// Packets for already-closed blocks or passed emit positions.
    pub dropped_late: usize,
    /// Packets with bad shape, size, or duplicate index.
    pub dropped_malformed: usize,
    /// Source packets reconstructed from repair data.
    pub repaired: usize,
    /// Source positions emitted as gaps.
    pub lost: usize,
}

/// Drives a [`BlockDecoder`] over the current source block and emits the
/// block's source packets in encoding-symbol order.
///
/// Downstream pulls; `read` returning `None` means "nothing yet", which
/// the depacketizer renders as silence. A source position is only
/// skipped once the stream has provably moved on — the block's full
/// repair tail arrived, or a later block showed up (the sender transmits
/// a block's repair symbols before the next block's source symbols).
pub struct FecReader {
    decoder: Box<dyn BlockDecoder>,
    source_reader: Box<dyn PacketReader>,
    repair_reader: Box<dyn PacketReader>,
    parser: Parser,
    addr: SocketAddr,
    payload_size: usize,
    rblen: usize,
    max_block_backlog: u32,
    max_sbn_jump: u32,

    cur_sbn: Option<Blknum>,
    /// Blocks before this are closed; their packets are late.
    floor: Option<Blknum>,
    sblen: usize,
    block_ok: bool,
    emit_cursor: usize,
    source_slots: Vec<Option<PacketPtr>>,
    slot_status: Vec<SlotStatus>,
    repair_seen: Vec<bool>,
    n_received: usize,
    max_seen_sbn: Option<Blknum>,

    next_source: VecDeque<PacketPtr>,
    next_repair: VecDeque<PacketPtr>,

    stats: FecStats,
}

impl FecReader {
    /// Assemble a reader over validated source packets and raw repair
    /// packets. `parser` re-parses recovered symbols (source protocol);
    /// `addr` is stamped on synthesized packets.
    #[must_use]
    pub fn new(
        config: &FecConfig,
        decoder: Box<dyn BlockDecoder>,
        source_reader: Box<dyn PacketReader>,
        repair_reader: Box<dyn PacketReader>,
        parser: Parser,
        addr: SocketAddr,
    ) -> Self {
        Self {
            decoder,
            source_reader,
            repair_reader,
            parser,
            addr,
            payload_size: config.payload_size,
            rblen: config.n_repair_packets,
            max_block_backlog: config.max_block_backlog,
            max_sbn_jump: config.max_sbn_jump,
            cur_sbn: None,
            floor: None,
            sblen: 0,
            block_ok: false,
            emit_cursor: 0,
            source_slots: Vec::new(),
            slot_status: Vec::new(),
            repair_seen: Vec::new(),
            n_received: 0,
            max_seen_sbn: None,
            next_source: VecDeque::new(),
            next_repair: VecDeque::new(),
            stats: FecStats::default(),
        }
    }

    /// Drop/repair counters so far.
    #[must_use]
    pub fn stats(&self) -> FecStats {
        self.stats
    }

    fn drain(&mut self) {
        while let Some(packet) = self.source_reader.read() {
            self.route(packet, false);
        }
        while let Some(packet) = self.repair_reader.read() {
            self.route(packet, true);
        }
    }

    fn route(&mut self, packet: PacketPtr, repair: bool) {
        let Some(meta) = packet.fec().copied() else {
            trace!("fec reader: packet without payload id");
            self.stats.dropped_malformed += 1;
            return;
        };
        if meta.sblen == 0 {
            trace!("fec reader: zero block length");
            self.stats.dropped_malformed += 1;
            return;
        }

        let Some(cur) = self.cur_sbn else {
            if let Some(floor) = self.floor {
                let dist = blk_diff(meta.sbn, floor);
                if dist < 0 {
                    self.stats.dropped_late += 1;
                    return;
                }
                if dist as u32 > self.max_sbn_jump {
                    trace!("fec reader: wild block jump {dist}");
                    self.stats.dropped_malformed += 1;
                    return;
                }
            }
            // Only a source packet opens a block. Repair packets are not
            // held back by the delayed reader, so they routinely arrive
            // while the block's source packets are still buffering; they
            // wait in the pre-queue until the sources show up.
            if repair {
                self.next_repair.push_back(packet);
                return;
            }
            self.start_block(meta.sbn, meta.sblen);
            self.accept(packet, repair);
            self.adopt_prequeued_repair();
            return;
        };

        let dist = blk_diff(meta.sbn, cur);
        if dist < 0 {
            self.stats.dropped_late += 1;
        } else if dist == 0 {
            self.accept(packet, repair);
        } else if dist as u32 <= self.max_sbn_jump {
            match self.max_seen_sbn {
                Some(max) if blk_diff(meta.sbn, max) <= 0 => {},
                _ => self.max_seen_sbn = Some(meta.sbn),
            }
            if repair {
                self.next_repair.push_back(packet);
            } else {
                self.next_source.push_back(packet);
            }
        } else {
            trace!("fec reader: wild block jump {dist}");
            self.stats.dropped_malformed += 1;
        }
    }

    fn start_block(&mut self, sbn: Blknum, sblen: usize) {
        debug_assert!(self.cur_sbn.is_none());

        self.cur_sbn = Some(sbn);
        self.sblen = sblen;
        self.emit_cursor = 0;
        self.n_received = 0;
        self.source_slots.clear();
        self.source_slots.resize(sblen, None);
        self.slot_status.clear();
        self.slot_status.resize(sblen, SlotStatus::Lost);
        self.repair_seen.clear();
        self.repair_seen.resize(self.rblen, false);

        self.block_ok = sblen > 0 && self.decoder.begin(sblen, self.rblen);
        if !self.block_ok {
            warn!("fec reader: cannot begin block of shape {sblen}+{}", self.rblen);
        }
    }

    fn accept(&mut self, packet: PacketPtr, repair: bool) {
        let meta = *packet.fec().expect("routed packets carry fec meta");

        if meta.sblen != self.sblen {
            trace!(
                "fec reader: block length mismatch: {} != {}",
                meta.sblen,
                self.sblen,
            );
            self.stats.dropped_malformed += 1;
            return;
        }

        let esi = meta.esi as usize;

        if repair {
            if esi < self.sblen || esi >= self.sblen + self.rblen {
                self.stats.dropped_malformed += 1;
                return;
            }
            if self.repair_seen[esi - self.sblen] {
                self.stats.dropped_late += 1;
                return;
            }
        } else {
            if esi >= self.sblen {
                self.stats.dropped_malformed += 1;
                return;
            }
            if esi < self.emit_cursor || self.source_slots[esi].is_some() {
                self.stats.dropped_late += 1;
                return;
            }
        }

        let symbol = packet.fec_symbol();
        if symbol.len() != self.payload_size {
            trace!(
                "fec reader: bad symbol size: {} != {}",
                symbol.len(),
                self.payload_size,
            );
            self.stats.dropped_malformed += 1;
            return;
        }

        if repair {
            self.repair_seen[esi - self.sblen] = true;
        } else {
            self.slot_status[esi] = SlotStatus::Received;
            self.source_slots[esi] = Some(packet);
        }
        self.n_received += 1;

        if self.block_ok {
            self.decoder.set(esi, symbol);
        }
    }

    /// True once no further symbol for the current block can arrive: the
    /// full repair tail was received, or the (ordered) sub-streams have
    /// produced packets of a later block, or the stream ran too far
    /// ahead. Only then is an unrepairable position a definitive loss.
    fn block_finished_sending(&self) -> bool {
        if self.repair_seen.iter().all(|&seen| seen) {
            return true;
        }
        if !self.next_source.is_empty() || !self.next_repair.is_empty() {
            return true;
        }
        match (self.cur_sbn, self.max_seen_sbn) {
            (Some(cur), Some(max)) => blk_diff(max, cur) > self.max_block_backlog as i32,
            _ => false,
        }
    }

    fn repair_slot(&mut self, index: usize) -> Option<PacketPtr> {
        if !self.block_ok {
            return None;
        }

        let symbol = self.decoder.repair(index)?;
        let packet = self.parser.parse(symbol, self.addr)?;

        // A repaired symbol must re-parse into the position it fills;
        // anything else means the sender and receiver disagree on shape.
        let consistent = packet
            .fec()
            .is_some_and(|meta| meta.esi as usize == index && meta.sblen == self.sblen);
        if !consistent {
            return None;
        }

        Some(packet)
    }

    fn finish_block(&mut self) {
        let lost = self
            .slot_status
            .iter()
            .filter(|&&s| s != SlotStatus::Received)
            .count();
        if lost > 0 {
            self.report();
        }

        if self.block_ok {
            self.decoder.end();
        }

        let cur = self.cur_sbn.take().expect("finishing an open block");
        self.floor = Some(blk_next(cur));
        self.try_start_from_prequeue();
    }

    fn try_start_from_prequeue(&mut self) {
        // A block opens on source data only; pre-queued repair for the
        // chosen block is adopted right after.
        let Some((sbn, shape)) = self
            .next_source
            .front()
            .and_then(|p| p.fec())
            .map(|m| (m.sbn, m.sblen))
        else {
            return;
        };

        self.start_block(sbn, shape);

        let mut source = std::mem::take(&mut self.next_source);
        for packet in source.drain(..) {
            self.route(packet, false);
        }
        self.adopt_prequeued_repair();
    }

    fn adopt_prequeued_repair(&mut self) {
        let mut repair = std::mem::take(&mut self.next_repair);
        for packet in repair.drain(..) {
            self.route(packet, true);
        }
    }

    fn report(&mut self) {
        let mut status = String::with_capacity(self.sblen + self.rblen + 1);
        let mut repaired = 0;
        for s in &self.slot_status {
            status.push(match s {
                SlotStatus::Received => '.',
                SlotStatus::Repaired => {
                    repaired += 1;
                    'r'
                },
                SlotStatus::Lost => 'X',
            });
        }
        status.push(' ');
        for &seen in &self.repair_seen {
            status.push(if seen { '.' } else { 'x' });
        }

        let lost = self.slot_status.iter().filter(|&&s| s == SlotStatus::Lost).count();
        self.stats.repaired += repaired;
        self.stats.lost += lost;

        debug!(
            "fec reader: block {}: repaired {}/{}/{} {}",
            self.cur_sbn.unwrap_or(0),
            repaired,
            repaired + lost,
            self.sblen + self.rblen,
            status,
        );
    }
}

impl PacketReader for FecReader {
    fn read(&mut self) -> Option<PacketPtr> {
        loop {
            self.drain();

            self.cur_sbn?;

            while self.emit_cursor < self.sblen {
                let at = self.emit_cursor;

                if let Some(packet) = self.source_slots[at].take() {
                    self.emit_cursor += 1;
                    return Some(packet);
                }

                if let Some(packet) = self.repair_slot(at) {
                    self.slot_status[at] = SlotStatus::Repaired;
                    self.emit_cursor += 1;
                    return Some(packet);
                }

                if self.block_finished_sending() {
                    // Unrecoverable; the gap becomes one packet of
                    // silence downstream.
                    self.emit_cursor += 1;
                    continue;
                }

                return None;
            }

            self.finish_block();

            if self.cur_sbn.is_none() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::Pool,
        constants::{PAYLOAD_ID_SIZE, RTP_HEADER_SIZE},
        fec::{new_decoder, new_encoder},
        packet::{Composer, FecMeta, Protocol, RtpHeader, SortedQueue},
    };
    use std::sync::Arc;

    const AUDIO_LEN: usize = 32;
    const PAYLOAD_SIZE: usize = RTP_HEADER_SIZE + PAYLOAD_ID_SIZE + AUDIO_LEN;
    const SBLEN: usize = 5;
    const RBLEN: usize = 3;
    const SPP: u32 = 8; // per-channel samples per packet (stereo, 16-bit)

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn config() -> FecConfig {
        FecConfig {
            payload_size: PAYLOAD_SIZE,
            n_source_packets: SBLEN,
            n_repair_packets: RBLEN,
            ..FecConfig::default()
        }
    }

    /// Sender-side image of one block: composed source datagrams (parsed
    /// into packets) and raw repair packets.
    fn make_block(sbn: Blknum, seq_base: u16) -> (Vec<PacketPtr>, Vec<PacketPtr>) {
        let composer = Composer::new(Protocol::RtpRsSource);
        let parser = Parser::new(Protocol::RtpRsSource);
        let repair_parser = Parser::new(Protocol::RsRepair);

        let mut encoder = new_encoder(&config(), Pool::new(PAYLOAD_SIZE, 32)).unwrap();
        assert!(encoder.begin(SBLEN, RBLEN));

        let mut sources = Vec::new();
        for i in 0..SBLEN {
            let header = RtpHeader {
                source: 0x5eed,
                seqnum: seq_base.wrapping_add(i as u16),
                timestamp: (u32::from(seq_base) + i as u32) * SPP,
                payload_type: 96,
                marker: false,
            };
            let meta = FecMeta {
                sbn,
                sblen: SBLEN,
                esi: i as u16,
            };
            let audio: Vec<u8> = (0..AUDIO_LEN).map(|j| (i * 40 + j) as u8).collect();
            let wire = composer.compose_source(&header, Some(&meta), &audio);
            let packet = parser.parse(wire, addr()).unwrap();
            encoder.set(i, packet.fec_symbol());
            sources.push(packet);
        }

        encoder.fill();
        let repair_composer = Composer::new(Protocol::RsRepair);
        let mut repairs = Vec::new();
        for r in 0..RBLEN {
            let symbol = encoder.repair(SBLEN + r).unwrap();
            let meta = FecMeta {
                sbn,
                sblen: SBLEN,
                esi: (SBLEN + r) as u16,
            };
            let wire = repair_composer.compose_repair(&meta, &symbol);
            repairs.push(repair_parser.parse(wire, addr()).unwrap());
        }

        (sources, repairs)
    }

    fn reader(
        source: &Arc<SortedQueue>,
        repair: &Arc<SortedQueue>,
    ) -> FecReader {
        let decoder = new_decoder(&config(), Pool::new(PAYLOAD_SIZE, 32)).unwrap();
        FecReader::new(
            &config(),
            decoder,
            Box::new(Arc::clone(source)),
            Box::new(Arc::clone(repair)),
            Parser::new(Protocol::RtpRsSource),
            addr(),
        )
    }

    fn seqnums(reader: &mut FecReader) -> Vec<u16> {
        std::iter::from_fn(|| reader.read())
            .map(|p| p.rtp().unwrap().seqnum)
            .collect()
    }

    #[test]
    fn passes_complete_block_through() {
        let (sources, _) = make_block(1, 100);
        let source_q = SortedQueue::new(None);
        let repair_q = SortedQueue::new(None);
        let mut fec = reader(&source_q, &repair_q);

        for p in &sources {
            source_q.push(Arc::clone(p));
        }
        assert_eq!(seqnums(&mut fec), vec![100, 101, 102, 103, 104]);
    }

    #[test]
    fn repairs_dropped_sources_bit_exact() {
        let (sources, repairs) = make_block(1, 100);
        let source_q = SortedQueue::new(None);
        let repair_q = SortedQueue::new(None);
        let mut fec = reader(&source_q, &repair_q);

        for (i, p) in sources.iter().enumerate() {
            if i != 1 && i != 3 {
                source_q.push(Arc::clone(p));
            }
        }
        for p in &repairs {
            repair_q.push(Arc::clone(p));
        }

        let out: Vec<PacketPtr> = std::iter::from_fn(|| fec.read()).collect();
        assert_eq!(out.len(), SBLEN);
        for (i, (got, want)) in out.iter().zip(&sources).enumerate() {
            assert_eq!(got.rtp().unwrap(), want.rtp().unwrap(), "packet {i}");
            assert_eq!(got.payload(), want.payload(), "packet {i} payload");
        }
        assert_eq!(fec.stats().repaired, 2);
    }

    #[test]
    fn skips_unrecoverable_positions_when_stream_moves_on() {
        let (first, _) = make_block(1, 100);
        let (second, _) = make_block(2, 105);
        let source_q = SortedQueue::new(None);
        let repair_q = SortedQueue::new(None);
        let mut fec = reader(&source_q, &repair_q);

        // Four of five sources lost, no repair at all; next block arrives.
        source_q.push(Arc::clone(&first[2]));
        for p in &second {
            source_q.push(Arc::clone(p));
        }

        assert_eq!(seqnums(&mut fec), vec![102, 105, 106, 107, 108, 109]);
        assert_eq!(fec.stats().lost, 4);
    }

    #[test]
    fn block_boundary_order_independence() {
        // Two adjacent blocks yield the same output stream whether the
        // second block's packets land in the queues before or after the
        // first block's repair tail (arrival inside the jitter window
        // that the sorted queues absorb).
        let (s1, r1) = make_block(1, 100);
        let (s2, r2) = make_block(2, 105);

        let run = |second_block_first: bool| -> Vec<u16> {
            let source_q = SortedQueue::new(None);
            let repair_q = SortedQueue::new(None);
            let mut fec = reader(&source_q, &repair_q);

            // First block's head packet is lost and needs repair data.
            let push = |p: &PacketPtr| {
                if p.rtp().is_some() {
                    source_q.push(Arc::clone(p));
                } else {
                    repair_q.push(Arc::clone(p));
                }
            };

            s1.iter().skip(1).for_each(&push);
            if second_block_first {
                s2.iter().chain(&r2).for_each(&push);
                r1.iter().for_each(&push);
            } else {
                r1.iter().for_each(&push);
                s2.iter().chain(&r2).for_each(&push);
            }

            seqnums(&mut fec)
        };

        let natural = run(false);
        let reordered = run(true);
        assert_eq!(natural, reordered);
        assert_eq!(natural, vec![100, 101, 102, 103, 104, 105, 106, 107, 108, 109]);
    }

    #[test]
    fn sbn_wrap_is_seamless() {
        let (s1, _) = make_block(0xff_ffff, 100);
        let (s2, _) = make_block(0, 105);
        let source_q = SortedQueue::new(None);
        let repair_q = SortedQueue::new(None);
        let mut fec = reader(&source_q, &repair_q);

        for p in s1.iter().chain(&s2) {
            source_q.push(Arc::clone(p));
        }
        assert_eq!(
            seqnums(&mut fec),
            vec![100, 101, 102, 103, 104, 105, 106, 107, 108, 109],
        );
    }

    #[test]
    fn late_packets_for_closed_blocks_are_dropped() {
        let (s1, r1) = make_block(1, 100);
        let (s2, _) = make_block(2, 105);
        let source_q = SortedQueue::new(None);
        let repair_q = SortedQueue::new(None);
        let mut fec = reader(&source_q, &repair_q);

        for p in s1.iter().chain(&s2) {
            source_q.push(Arc::clone(p));
        }
        let n = seqnums(&mut fec).len();
        assert_eq!(n, 10);

        // Repair for block 1 shows up after both blocks closed.
        repair_q.push(Arc::clone(&r1[0]));
        assert!(fec.read().is_none());
        assert_eq!(fec.stats().dropped_late, 1);
    }
}
