//! Frame model and the audio-side reader chain.

mod depacketizer;
mod latency;
mod packetizer;
mod resampler;
mod watchdog;

pub use self::{
    depacketizer::Depacketizer,
    latency::{LatencyConfig, LatencyMonitor},
    packetizer::Packetizer,
    resampler::{Resampler, ResamplerConfig, ResamplerProfile},
    watchdog::{Watchdog, WatchdogConfig},
};

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

/// Interleaved PCM sample.
pub type Sample = f32;

/// Fill-quality flags of a produced frame.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Not a single sample came from a packet.
    pub const EMPTY: FrameFlags = FrameFlags(0x01);
    /// At least one gap was filled with silence.
    pub const INCOMPLETE: FrameFlags = FrameFlags(0x02);
    /// Corrupt input was observed while building the frame.
    pub const BROKEN: FrameFlags = FrameFlags(0x04);

    /// Merge flag sets.
    #[must_use]
    pub fn with(self, other: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | other.0)
    }

    /// True if every bit of `other` is set.
    #[must_use]
    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Remove a flag set.
    #[must_use]
    pub fn without(self, other: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 & !other.0)
    }
}

/// A fixed-size block of interleaved samples with a playback timestamp.
///
/// Frames are owned by the caller and refilled in place on every read;
/// `timestamp` advances by exactly the per-channel sample count per frame
/// regardless of what the network delivered.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    /// Interleaved samples, `frame_size * channels` long.
    pub samples: Vec<Sample>,
    /// Monotonic playback timestamp of the first sample, per-channel units.
    pub timestamp: u64,
    /// Fill quality of this frame.
    pub flags: FrameFlags,
}

impl Frame {
    /// A silent frame of `len` interleaved samples.
    #[must_use]
    pub fn silent(len: usize) -> Self {
        Self {
            samples: vec![0.0; len],
            timestamp: 0,
            flags: FrameFlags::default(),
        }
    }

    /// Zero the samples and clear the flags, keeping length and timestamp.
    pub fn clear(&mut self) {
        self.samples.fill(0.0);
        self.flags = FrameFlags::default();
    }
}

/// Pull side of a frame stage.
pub trait FrameReader: Send {
    /// Fill `frame` in place. Starvation is expressed through flags, not
    /// through a return value; the chain always produces audio.
    fn read(&mut self, frame: &mut Frame);
}

/// Where the depacketizer currently consumes the RTP timeline.
///
/// Written by the depacketizer on every frame, read by the latency
/// monitor from the session tick.
#[derive(Debug, Default)]
pub struct Playhead {
    timestamp: AtomicU32,
    valid: AtomicBool,
}

impl Playhead {
    /// Fresh, unpositioned playhead.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish the next timestamp to be consumed.
    pub fn set(&self, timestamp: u32) {
        self.timestamp.store(timestamp, Ordering::Release);
        self.valid.store(true, Ordering::Release);
    }

    /// Current consumption point, `None` before the first packet.
    #[must_use]
    pub fn get(&self) -> Option<u32> {
        if self.valid.load(Ordering::Acquire) {
            Some(self.timestamp.load(Ordering::Acquire))
        } else {
            None
        }
    }
}

/// Live resampling ratio shared between the latency monitor (writer) and
/// the resampler (reader).
#[derive(Debug)]
pub struct ScalingHandle {
    bits: AtomicU32,
}

impl Default for ScalingHandle {
    fn default() -> Self {
        Self {
            bits: AtomicU32::new(1.0f32.to_bits()),
        }
    }
}

impl ScalingHandle {
    /// Handle initialised to a ratio of 1.0.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the ratio.
    pub fn set(&self, scaling: f32) {
        self.bits.store(scaling.to_bits(), Ordering::Release);
    }

    /// Current ratio.
    #[must_use]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Acquire))
    }
}
