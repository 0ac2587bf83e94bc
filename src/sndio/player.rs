//! The audio context: a paced loop pulling frames into a sink.

use super::AudioSink;
use crate::{audio::Frame, receiver::Receiver};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info};

/// Owns the receiver and the sink, pulling one frame per timestep.
///
/// Every pull doubles as the pipeline tick: watchdogs and latency
/// monitors run right after the frame completes. File sinks do not
/// exert backpressure, so the loop paces itself against the wall clock.
pub struct Player {
    receiver: Receiver,
    sink: Box<dyn AudioSink>,
    frame: Frame,
    frame_duration: Duration,
    oneshot: bool,
    stop: Arc<AtomicBool>,
}

impl Player {
    /// Build the audio-context loop; `stop` requests a graceful exit.
    #[must_use]
    pub fn new(
        receiver: Receiver,
        sink: Box<dyn AudioSink>,
        frame_size: usize,
        channels: usize,
        sample_rate: usize,
        oneshot: bool,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            receiver,
            sink,
            frame: Frame::silent(frame_size * channels),
            frame_duration: Duration::from_secs_f64(frame_size as f64 / sample_rate as f64),
            oneshot,
            stop,
        }
    }

    /// Run until stopped, the sink fails, or (oneshot) the last session
    /// ends. Returns the sink error if any.
    pub fn run(mut self) -> io::Result<()> {
        info!("player started");
        let mut next = Instant::now();

        while !self.stop.load(Ordering::Acquire) {
            self.receiver.read(&mut self.frame);
            self.sink.write(&self.frame)?;
            self.receiver.update();

            if self.oneshot && self.receiver.had_session() && self.receiver.session_count() == 0 {
                debug!("oneshot: all sessions ended");
                break;
            }

            next += self.frame_duration;
            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            } else {
                // Fell behind (slow disk, scheduling); don't try to
                // catch up in one burst.
                next = now;
            }
        }

        info!("player stopped");
        Ok(())
    }
}
