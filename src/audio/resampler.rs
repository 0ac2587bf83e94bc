//! Adaptive windowed-sinc resampler.
//!
//! Converts between the sender's and receiver's sample rates while the
//! latency monitor trims the ratio around its nominal value to cancel
//! clock drift. The kernel is a Blackman-windowed sinc sampled at
//! `window_interp` points per unit; interpolation reads `2 * window_size`
//! taps around the fractional input position.

use super::{Frame, FrameFlags, FrameReader, Sample, ScalingHandle};
use std::sync::Arc;
use tracing::debug;

/// Quality/cost presets mirroring the `low`/`medium`/`high` CLI choices.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResamplerProfile {
    /// 16 taps, 64-step interpolation.
    Low,
    /// 32 taps, 128-step interpolation.
    Medium,
    /// 64 taps, 512-step interpolation.
    High,
}

/// Kernel parameters.
#[derive(Clone, Copy, Debug)]
pub struct ResamplerConfig {
    /// Half-width of the interpolation window, in taps per side.
    pub window_size: usize,
    /// Kernel table resolution per unit distance.
    pub window_interp: usize,
}

impl Default for ResamplerConfig {
    fn default() -> Self {
        ResamplerProfile::Medium.config()
    }
}

impl ResamplerProfile {
    /// The kernel parameters of this profile.
    #[must_use]
    pub fn config(self) -> ResamplerConfig {
        match self {
            ResamplerProfile::Low => ResamplerConfig {
                window_size: 16,
                window_interp: 64,
            },
            ResamplerProfile::Medium => ResamplerConfig {
                window_size: 32,
                window_interp: 128,
            },
            ResamplerProfile::High => ResamplerConfig {
                window_size: 64,
                window_interp: 512,
            },
        }
    }
}

/// Rate-converting frame reader.
pub struct Resampler {
    reader: Box<dyn FrameReader>,
    channels: usize,
    scaling: Arc<ScalingHandle>,
    base_ratio: f64,

    window_size: usize,
    window_interp: usize,
    table: Vec<f32>,
    weights: Vec<f32>,

    /// Interleaved input history; `pos` indexes it in per-channel units.
    buf: Vec<Sample>,
    pos: f64,
    in_frame: Frame,
    in_flags: FrameFlags,
    /// Whether every input frame consumed for the current output was empty.
    all_empty: bool,
    any_consumed: bool,

    out_ts: u64,
}

impl Resampler {
    /// Build over `reader`, converting `input_rate` to `output_rate`.
    /// The live scaling factor multiplies on top of that base ratio.
    #[must_use]
    pub fn new(
        reader: Box<dyn FrameReader>,
        config: &ResamplerConfig,
        channels: usize,
        frame_size: usize,
        input_rate: usize,
        output_rate: usize,
        scaling: Arc<ScalingHandle>,
    ) -> Self {
        let window_size = config.window_size.max(2);
        let window_interp = config.window_interp.max(8);

        debug!(
            "resampler: window {window_size}x{window_interp}, {input_rate} -> {output_rate}",
        );

        Self {
            reader,
            channels,
            scaling,
            base_ratio: input_rate as f64 / output_rate as f64,
            window_size,
            window_interp,
            table: build_table(window_size, window_interp),
            weights: vec![0.0; 2 * window_size],
            buf: Vec::new(),
            pos: (window_size - 1) as f64,
            in_frame: Frame::silent(frame_size * channels),
            in_flags: FrameFlags::EMPTY,
            all_empty: true,
            any_consumed: false,
            out_ts: 0,
        }
    }

    /// Current effective input/output ratio.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.base_ratio * f64::from(self.scaling.get())
    }

    /// Adjust the drift factor; equivalent to writing through the shared
    /// handle the latency monitor owns.
    pub fn set_scaling(&mut self, scaling: f32) {
        self.scaling.set(scaling);
    }

    fn pull_input(&mut self) {
        let mut frame = std::mem::take(&mut self.in_frame);
        frame.clear();
        self.reader.read(&mut frame);

        self.buf.extend_from_slice(&frame.samples);
        self.in_flags = self.in_flags.with(frame.flags);
        self.all_empty &= frame.flags.contains(FrameFlags::EMPTY);
        self.any_consumed = true;

        self.in_frame = frame;
    }

    /// Interpolation weights for the fractional offset `frac`, shared by
    /// all channels of one output sample. Returns the weight sum for
    /// normalisation.
    fn fill_weights(&mut self, frac: f64) -> f32 {
        let mut sum = 0.0f32;
        for t in 0..2 * self.window_size {
            let x = (t as f64 + 1.0 - self.window_size as f64 - frac).abs();
            let idx = (x * self.window_interp as f64).round() as usize;
            let w = self.table.get(idx).copied().unwrap_or(0.0);
            self.weights[t] = w;
            sum += w;
        }
        sum
    }
}

impl FrameReader for Resampler {
    fn read(&mut self, frame: &mut Frame) {
        let frame_size = frame.samples.len() / self.channels;
        let ratio = self.scaling().clamp(0.125, 8.0);

        self.in_flags = FrameFlags::default();
        self.all_empty = true;
        self.any_consumed = false;

        for n in 0..frame_size {
            let needed = self.pos as usize + self.window_size + 1;
            while self.buf.len() / self.channels < needed {
                self.pull_input();
            }

            let i0 = self.pos as usize;
            let frac = self.pos - i0 as f64;
            let sum = self.fill_weights(frac);

            for ch in 0..self.channels {
                let mut acc = 0.0f32;
                for t in 0..2 * self.window_size {
                    let idx = i0 + t + 1 - self.window_size;
                    acc += self.buf[idx * self.channels + ch] * self.weights[t];
                }
                frame.samples[n * self.channels + ch] = if sum > 0.0 { acc / sum } else { 0.0 };
            }

            self.pos += ratio;
        }

        // Keep one window of history, drop the rest.
        let keep_from = (self.pos as usize).saturating_sub(self.window_size - 1);
        if keep_from > 0 {
            self.buf.drain(..keep_from * self.channels);
            self.pos -= keep_from as f64;
        }

        frame.flags = if self.any_consumed {
            let mut flags = self.in_flags;
            if !self.all_empty {
                flags = flags.without(FrameFlags::EMPTY);
            }
            flags
        } else {
            self.in_flags
        };
        frame.timestamp = self.out_ts;
        self.out_ts += frame_size as u64;
    }
}

fn build_table(window_size: usize, window_interp: usize) -> Vec<f32> {
    let len = window_size * window_interp + 1;
    let mut table = Vec::with_capacity(len);

    for i in 0..len {
        let x = i as f64 / window_interp as f64;
        let sinc = if x == 0.0 {
            1.0
        } else {
            let px = std::f64::consts::PI * x;
            px.sin() / px
        };
        // Blackman window over [-window_size, window_size].
        let arg = std::f64::consts::PI * x / window_size as f64;
        let win = 0.42 + 0.5 * arg.cos() + 0.08 * (2.0 * arg).cos();
        table.push((sinc * win) as f32);
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    const CH: usize = 2;
    const FRAME: usize = 64;

    /// Feeds a sine of the given frequency per sample index.
    struct SineReader {
        t: u64,
        flags: FrameFlags,
    }

    impl FrameReader for SineReader {
        fn read(&mut self, frame: &mut Frame) {
            for chunk in frame.samples.chunks_mut(CH) {
                let v = sine(self.t);
                for s in chunk {
                    *s = v;
                }
                self.t += 1;
            }
            frame.flags = self.flags;
        }
    }

    fn sine(t: u64) -> f32 {
        ((t as f64) * 0.05).sin() as f32
    }

    fn resampler(reader: SineReader, in_rate: usize, out_rate: usize) -> Resampler {
        Resampler::new(
            Box::new(reader),
            &ResamplerProfile::Medium.config(),
            CH,
            FRAME,
            in_rate,
            out_rate,
            ScalingHandle::new(),
        )
    }

    #[test]
    fn unity_ratio_is_transparent() {
        let mut rs = resampler(SineReader { t: 0, flags: FrameFlags::default() }, 44_100, 44_100);
        let mut frame = Frame::silent(FRAME * CH);

        // Settle one frame, then expect bit-near passthrough shifted by
        // the window history.
        rs.read(&mut frame);
        let offset = (rs.window_size - 1) as u64;

        rs.read(&mut frame);
        for (n, chunk) in frame.samples.chunks(CH).enumerate() {
            let want = sine(FRAME as u64 + n as u64 + offset);
            assert!(
                (chunk[0] - want).abs() < 1e-3,
                "sample {n}: {} vs {want}",
                chunk[0],
            );
        }
        assert_eq!(frame.timestamp, FRAME as u64);
    }

    #[test]
    fn downrate_consumes_proportionally() {
        let mut rs = resampler(SineReader { t: 0, flags: FrameFlags::default() }, 48_000, 24_000);
        let mut frame = Frame::silent(FRAME * CH);

        for _ in 0..8 {
            rs.read(&mut frame);
        }
        assert!((rs.scaling() - 2.0).abs() < 1e-9);

        // Output must track a sine at twice the stride, and stay smooth.
        let diffs: Vec<f32> = frame
            .samples
            .chunks(CH)
            .map(|c| c[0])
            .collect::<Vec<_>>()
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .collect();
        assert!(diffs.iter().all(|&d| d < 0.25), "output must stay continuous");
    }

    #[test]
    fn drift_scaling_shifts_consumption() {
        let handle = ScalingHandle::new();
        let mut rs = Resampler::new(
            Box::new(SineReader { t: 0, flags: FrameFlags::default() }),
            &ResamplerProfile::Low.config(),
            CH,
            FRAME,
            44_100,
            44_100,
            Arc::clone(&handle),
        );
        handle.set(1.01);

        let mut frame = Frame::silent(FRAME * CH);
        rs.read(&mut frame);
        assert!((rs.scaling() - 1.01).abs() < 1e-6);
        rs.set_scaling(0.99);
        assert!((rs.scaling() - 0.99).abs() < 1e-6);
    }

    #[test]
    fn input_flags_propagate() {
        let mut rs = resampler(
            SineReader { t: 0, flags: FrameFlags::EMPTY.with(FrameFlags::BROKEN) },
            44_100,
            44_100,
        );
        let mut frame = Frame::silent(FRAME * CH);
        rs.read(&mut frame);
        assert!(frame.flags.contains(FrameFlags::EMPTY));
        assert!(frame.flags.contains(FrameFlags::BROKEN));
    }
}
