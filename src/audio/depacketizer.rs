//! Packet stream to sample stream conversion.

use super::{Frame, FrameFlags, FrameReader, Playhead, Sample};
use crate::{
    packet::{ts_diff, PacketReader},
    rtp::Decoder,
};
use std::sync::Arc;
use tracing::trace;

/// Pulls packets, decodes them, and aligns the samples against a running
/// playback timestamp. Timestamp gaps become silence (or a diagnostic
/// beep); anything arriving behind the playhead is skipped.
pub struct Depacketizer {
    reader: Box<dyn PacketReader>,
    decoder: Box<dyn Decoder>,
    channels: usize,
    sample_rate: usize,
    beep: bool,
    playhead: Arc<Playhead>,

    /// Next stream timestamp to be consumed, valid after the first packet.
    next_ts: u32,
    ts_valid: bool,

    /// Decoded samples of the packet currently being consumed.
    pending: Vec<Sample>,
    pending_ts: u32,
    pending_pos: usize,

    playback_ts: u64,

    n_late: u64,
    n_bad_payload: u64,
}

impl Depacketizer {
    /// Build over a validated packet stream.
    #[must_use]
    pub fn new(
        reader: Box<dyn PacketReader>,
        decoder: Box<dyn Decoder>,
        channels: usize,
        sample_rate: usize,
        beep: bool,
        playhead: Arc<Playhead>,
    ) -> Self {
        Self {
            reader,
            decoder,
            channels,
            sample_rate,
            beep,
            playhead,
            next_ts: 0,
            ts_valid: false,
            pending: Vec::new(),
            pending_ts: 0,
            pending_pos: 0,
            playback_ts: 0,
            n_late: 0,
            n_bad_payload: 0,
        }
    }

    fn pending_left(&self) -> usize {
        self.pending.len() / self.channels - self.pending_pos
    }

    /// Fetch and decode the next usable packet. Returns false when the
    /// upstream has nothing; sets the broken marker on corrupt input.
    fn fetch(&mut self, broken: &mut bool) -> bool {
        loop {
            let Some(packet) = self.reader.read() else {
                return false;
            };

            let duration = packet.duration(self.channels);
            if duration == 0 {
                self.n_bad_payload += 1;
                *broken = true;
                continue;
            }

            let rtp = packet.rtp().expect("validated packets carry rtp");

            if !self.ts_valid {
                self.next_ts = rtp.timestamp;
                self.ts_valid = true;
            }

            // Entirely behind the playhead: skip. Should not survive the
            // sorted queue, but recovered packets can be arbitrarily old.
            if ts_diff(rtp.timestamp.wrapping_add(duration), self.next_ts) <= 0 {
                trace!("depacketizer: dropping late packet");
                self.n_late += 1;
                *broken = true;
                continue;
            }

            self.pending.clear();
            if !self.decoder.decode(&packet.payload(), &mut self.pending) {
                self.n_bad_payload += 1;
                *broken = true;
                continue;
            }

            self.pending_ts = rtp.timestamp;
            self.pending_pos = 0;

            // Leading overlap with already-played audio is skipped.
            let lead = ts_diff(self.next_ts, rtp.timestamp);
            if lead > 0 {
                self.pending_pos = lead as usize;
                self.n_late += 1;
                *broken = true;
            }

            return true;
        }
    }

    fn fill_silence(&mut self, frame: &mut Frame, at: usize, len: usize) {
        let lo = at * self.channels;
        let hi = (at + len) * self.channels;
        if self.beep {
            for i in at..at + len {
                let t = (self.playback_ts + i as u64) as f64 / self.sample_rate as f64;
                let tone = (2.0 * std::f64::consts::PI * 880.0 * t).sin() as Sample * 0.1;
                for ch in 0..self.channels {
                    frame.samples[i * self.channels + ch] = tone;
                }
            }
        } else {
            frame.samples[lo..hi].fill(0.0);
        }
    }
}

impl FrameReader for Depacketizer {
    fn read(&mut self, frame: &mut Frame) {
        let frame_size = frame.samples.len() / self.channels;
        let mut filled = 0usize;
        let mut from_packets = 0usize;
        let mut gap_filled = false;
        let mut broken = false;

        while filled < frame_size {
            if self.pending_left() == 0 && !self.fetch(&mut broken) {
                // Starved: the rest of the frame is silence.
                let n = frame_size - filled;
                self.fill_silence(frame, filled, n);
                filled += n;
                if self.ts_valid {
                    self.next_ts = self.next_ts.wrapping_add(n as u32);
                    gap_filled = true;
                }
                break;
            }

            if self.pending_left() == 0 {
                continue;
            }

            let cursor_ts = self.pending_ts.wrapping_add(self.pending_pos as u32);
            let gap = ts_diff(cursor_ts, self.next_ts);
            if gap > 0 {
                // The packet starts in the future: silence up to it.
                let n = (gap as usize).min(frame_size - filled);
                self.fill_silence(frame, filled, n);
                filled += n;
                self.next_ts = self.next_ts.wrapping_add(n as u32);
                gap_filled = true;
                continue;
            }

            let n = self.pending_left().min(frame_size - filled);
            let src = &self.pending[self.pending_pos * self.channels..][..n * self.channels];
            frame.samples[filled * self.channels..][..n * self.channels].copy_from_slice(src);
            self.pending_pos += n;
            self.next_ts = self.next_ts.wrapping_add(n as u32);
            filled += n;
            from_packets += n;
        }

        let mut flags = FrameFlags::default();
        if from_packets == 0 {
            flags = flags.with(FrameFlags::EMPTY);
        } else if gap_filled {
            flags = flags.with(FrameFlags::INCOMPLETE);
        }
        if broken {
            flags = flags.with(FrameFlags::BROKEN);
        }
        frame.flags = flags;

        frame.timestamp = self.playback_ts;
        self.playback_ts += frame_size as u64;

        if self.ts_valid {
            self.playhead.set(self.next_ts);
        }
    }
}
