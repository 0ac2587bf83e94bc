//! Buffered-latency measurement and drift control.

use super::{Playhead, ScalingHandle};
use crate::packet::{ts_diff, SortedQueue};
use std::sync::Arc;
use tracing::{debug, warn};

/// Proportional gain applied to the normalised latency error.
const SCALING_GAIN: f32 = 0.05;

/// Exponential smoothing applied to scaling updates.
const SCALING_SMOOTH: f32 = 0.1;

/// Latency targets, in per-channel samples of the session rate.
#[derive(Clone, Copy, Debug)]
pub struct LatencyConfig {
    /// Latency the control loop steers towards.
    pub target_latency: u32,
    /// Leaving `[min_latency, max_latency]` longer than the grace period
    /// kills the session.
    pub min_latency: u32,
    /// Upper bound of the tolerated window.
    pub max_latency: u32,
    /// Grace period for out-of-window excursions, in samples.
    pub grace: u32,
    /// Duration of one media packet; the queue tail timestamp marks the
    /// newest packet's start, so this many samples complete the measure.
    pub packet_duration: u32,
}

/// Watches how much audio sits between the newest queued packet and the
/// depacketizer's playhead, trimming the resampler against clock drift
/// and flagging terminal under/overruns.
pub struct LatencyMonitor {
    queue: Arc<SortedQueue>,
    playhead: Arc<Playhead>,
    scaling: Option<Arc<ScalingHandle>>,
    config: LatencyConfig,
    /// Latency only becomes measurable once playback has begun; the
    /// delayed reader guarantees it starts near the target.
    started: bool,
    out_of_window_since: Option<u64>,
    freq: f32,
}

impl LatencyMonitor {
    /// Build over the session's source queue and playhead. `scaling` is
    /// absent when resampling is disabled, leaving only the window check.
    #[must_use]
    pub fn new(
        queue: Arc<SortedQueue>,
        playhead: Arc<Playhead>,
        scaling: Option<Arc<ScalingHandle>>,
        config: LatencyConfig,
    ) -> Self {
        Self {
            queue,
            playhead,
            scaling,
            config,
            started: false,
            out_of_window_since: None,
            freq: 1.0,
        }
    }

    /// Current buffered latency in samples, once measurable.
    #[must_use]
    pub fn latency(&self) -> Option<i32> {
        let tail = self.queue.latest_timestamp()?;
        let head = self.playhead.get()?;
        Some(ts_diff(tail.wrapping_add(self.config.packet_duration), head))
    }

    /// One control tick at sample-clock `now`. False is terminal.
    pub fn update(&mut self, now: u64) -> bool {
        let Some(latency) = self.latency() else {
            return true;
        };

        if !self.started {
            debug!("latency monitor: started at {latency} samples");
            self.started = true;
        }

        let in_window = latency >= self.config.min_latency as i32
            && latency <= self.config.max_latency as i32;
        if in_window {
            self.out_of_window_since = None;
        } else {
            let since = *self.out_of_window_since.get_or_insert(now);
            if now.saturating_sub(since) > u64::from(self.config.grace) {
                warn!(
                    "latency monitor: {latency} samples outside [{}, {}] for too long",
                    self.config.min_latency, self.config.max_latency,
                );
                return false;
            }
        }

        if let Some(scaling) = &self.scaling {
            let target = self.config.target_latency as f32;
            let error = latency as f32 - target;

            let lo = target / self.config.max_latency as f32;
            let hi = target / self.config.min_latency as f32;
            let adjust = (1.0 + SCALING_GAIN * error / target).clamp(lo, hi);

            self.freq += (adjust - self.freq) * SCALING_SMOOTH;
            scaling.set(self.freq);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, PacketFlags, PacketPtr, RtpHeader};
    use bytes::Bytes;

    fn config() -> LatencyConfig {
        LatencyConfig {
            target_latency: 1000,
            min_latency: 500,
            max_latency: 2000,
            grace: 400,
            packet_duration: 0,
        }
    }

    fn push(queue: &Arc<SortedQueue>, seqnum: u16, timestamp: u32) {
        let packet: PacketPtr = Packet::new(
            PacketFlags::AUDIO,
            Some(RtpHeader {
                source: 1,
                seqnum,
                timestamp,
                payload_type: 96,
                marker: false,
            }),
            None,
            Bytes::new(),
            Bytes::new(),
            "127.0.0.1:4000".parse().unwrap(),
        );
        queue.push(packet);
    }

    #[test]
    fn passive_until_playback_begins() {
        let queue = SortedQueue::new(None);
        let playhead = Playhead::new();
        let mut monitor =
            LatencyMonitor::new(Arc::clone(&queue), Arc::clone(&playhead), None, config());

        // No packets, no playhead: nothing to measure, nothing to kill.
        assert!(monitor.update(0));
        assert!(!monitor.started);

        push(&queue, 0, 600);
        assert!(monitor.update(100));
        assert!(!monitor.started);

        playhead.set(0);
        assert_eq!(monitor.latency(), Some(600));
        assert!(monitor.update(200));
        assert!(monitor.started);
    }

    #[test]
    fn sustained_underrun_is_terminal() {
        let queue = SortedQueue::new(None);
        let playhead = Playhead::new();
        let mut monitor =
            LatencyMonitor::new(Arc::clone(&queue), Arc::clone(&playhead), None, config());

        push(&queue, 0, 1200);
        playhead.set(0);
        assert!(monitor.update(0)); // started at 1200

        // Playhead overtakes the stream tail: latency collapses.
        playhead.set(1100);
        assert!(monitor.update(1000));
        assert!(monitor.update(1300));
        // Within grace (400 samples since 1000): still alive...
        assert!(monitor.update(1400));
        // ...but one tick beyond the grace period is terminal.
        assert!(!monitor.update(1401));
    }

    #[test]
    fn drift_steers_scaling() {
        let queue = SortedQueue::new(None);
        let playhead = Playhead::new();
        let scaling = ScalingHandle::new();
        let mut monitor = LatencyMonitor::new(
            Arc::clone(&queue),
            Arc::clone(&playhead),
            Some(Arc::clone(&scaling)),
            config(),
        );

        push(&queue, 0, 1500);
        playhead.set(0);
        assert!(monitor.update(0));

        // Latency above target: consume faster (> 1.0).
        for now in 1..50u64 {
            assert!(monitor.update(now * 10));
        }
        assert!(scaling.get() > 1.0);

        // Latency below target: consume slower (< 1.0).
        playhead.set(800);
        for now in 50..100u64 {
            assert!(monitor.update(now * 10));
        }
        assert!(scaling.get() < 1.0);
    }
}
