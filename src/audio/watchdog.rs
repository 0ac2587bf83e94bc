//! Terminal stream-failure detection.

use super::{Frame, FrameFlags, FrameReader};
use tracing::warn;

/// Watchdog thresholds, in per-channel samples / frames.
#[derive(Clone, Copy, Debug)]
pub struct WatchdogConfig {
    /// Samples of uninterrupted empty output after which the session is
    /// declared dead. Zero disables the detector.
    pub no_playback_timeout: u32,
    /// Length of the sliding frame-status window. Zero disables the
    /// breakage detector.
    pub frame_status_window: usize,
    /// Fraction of broken frames within the window that is terminal.
    pub broken_threshold: f32,
}

/// Terminal frame reader: passes frames through while keeping score of
/// their fill quality.
///
/// Two independent detectors: a run of empty frames longer than
/// `no_playback_timeout` (strictly longer — a gap of exactly the timeout
/// survives), and a sliding window in which too many frames carry the
/// broken flag.
pub struct Watchdog {
    reader: Box<dyn FrameReader>,
    channels: usize,
    config: WatchdogConfig,
    empty_run: u64,
    window: Vec<bool>,
    window_at: usize,
    window_filled: usize,
    n_broken_in_window: usize,
    alive: bool,
}

impl Watchdog {
    /// Wrap the terminal reader of a session chain.
    #[must_use]
    pub fn new(reader: Box<dyn FrameReader>, channels: usize, config: WatchdogConfig) -> Self {
        Self {
            reader,
            channels,
            config,
            empty_run: 0,
            window: vec![false; config.frame_status_window],
            window_at: 0,
            window_filled: 0,
            n_broken_in_window: 0,
            alive: true,
        }
    }

    /// False once either detector has fired; checked from the session
    /// tick. The current frame always completes (no mid-frame abort).
    pub fn update(&mut self) -> bool {
        if !self.alive {
            return false;
        }

        if self.config.no_playback_timeout != 0
            && self.empty_run > u64::from(self.config.no_playback_timeout)
        {
            warn!(
                "watchdog: no playback for {} samples (timeout {})",
                self.empty_run, self.config.no_playback_timeout,
            );
            self.alive = false;
            return false;
        }

        if self.config.frame_status_window != 0 && self.window_filled == self.window.len() {
            let fraction = self.n_broken_in_window as f32 / self.window.len() as f32;
            if fraction > self.config.broken_threshold {
                warn!(
                    "watchdog: {}/{} broken frames in window",
                    self.n_broken_in_window,
                    self.window.len(),
                );
                self.alive = false;
                return false;
            }
        }

        true
    }

    fn record(&mut self, flags: FrameFlags, frame_samples: u64) {
        if flags.contains(FrameFlags::EMPTY) {
            self.empty_run += frame_samples;
        } else {
            self.empty_run = 0;
        }

        if !self.window.is_empty() {
            let broken = flags.contains(FrameFlags::BROKEN);
            if self.window_filled == self.window.len() {
                if self.window[self.window_at] {
                    self.n_broken_in_window -= 1;
                }
            } else {
                self.window_filled += 1;
            }
            self.window[self.window_at] = broken;
            if broken {
                self.n_broken_in_window += 1;
            }
            self.window_at = (self.window_at + 1) % self.window.len();
        }
    }
}

impl FrameReader for Watchdog {
    fn read(&mut self, frame: &mut Frame) {
        self.reader.read(frame);

        let per_channel = (frame.samples.len() / self.channels) as u64;
        self.record(frame.flags, per_channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedReader {
        script: Vec<FrameFlags>,
        at: usize,
    }

    impl FrameReader for ScriptedReader {
        fn read(&mut self, frame: &mut Frame) {
            frame.flags = self.script[self.at.min(self.script.len() - 1)];
            self.at += 1;
        }
    }

    const FRAME: usize = 100;
    const CH: usize = 2;

    fn watchdog(script: Vec<FrameFlags>, config: WatchdogConfig) -> Watchdog {
        Watchdog::new(Box::new(ScriptedReader { script, at: 0 }), CH, config)
    }

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            no_playback_timeout: 500,
            frame_status_window: 10,
            broken_threshold: 0.4,
        }
    }

    #[test]
    fn exact_timeout_does_not_trigger() {
        // 500 samples of silence = 5 empty frames: still alive; the
        // 501st sample (one more frame) is terminal.
        let mut w = watchdog(vec![FrameFlags::EMPTY], config());
        let mut frame = Frame::silent(FRAME * CH);

        for _ in 0..5 {
            w.read(&mut frame);
            assert!(w.update());
        }

        w.read(&mut frame);
        assert!(!w.update());
        assert!(!w.update());
    }

    #[test]
    fn playback_resets_the_run() {
        let script = vec![
            FrameFlags::EMPTY,
            FrameFlags::EMPTY,
            FrameFlags::default(),
            FrameFlags::EMPTY,
        ];
        let mut w = watchdog(script, config());
        let mut frame = Frame::silent(FRAME * CH);

        for _ in 0..4 {
            w.read(&mut frame);
            assert!(w.update());
        }
        assert_eq!(w.empty_run, 100);
    }

    #[test]
    fn broken_fraction_is_terminal() {
        let mut script = vec![FrameFlags::default(); 6];
        script.extend(vec![FrameFlags::BROKEN; 5]);
        let mut w = watchdog(script, config());
        let mut frame = Frame::silent(FRAME * CH);

        // Window fills with 6 clean + 4 broken = 40%: not above the 0.4
        // threshold yet.
        for _ in 0..10 {
            w.read(&mut frame);
            assert!(w.update());
        }

        // One more broken frame pushes the window to 50%.
        w.read(&mut frame);
        assert!(!w.update());
    }

    #[test]
    fn zero_timeouts_disable_detectors() {
        let cfg = WatchdogConfig {
            no_playback_timeout: 0,
            frame_status_window: 0,
            broken_threshold: 0.0,
        };
        let mut w = watchdog(vec![FrameFlags::EMPTY.with(FrameFlags::BROKEN)], cfg);
        let mut frame = Frame::silent(FRAME * CH);

        for _ in 0..100 {
            w.read(&mut frame);
            assert!(w.update());
        }
    }
}
