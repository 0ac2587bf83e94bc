//! Configuration for receivers, senders, and their sessions.

use crate::{
    audio::ResamplerConfig,
    constants::*,
    error::{Error, Result},
    fec::FecScheme,
    rtp::ValidatorConfig,
};
use std::time::Duration;

/// FEC knobs as configured from the outside; the wire-level
/// [`crate::fec::FecConfig`] is derived per session once the payload
/// size is known.
#[derive(Clone, Copy, Debug)]
pub struct FecParams {
    /// Which codec protects the stream.
    pub scheme: FecScheme,
    /// Source packets per block.
    pub n_source_packets: usize,
    /// Repair packets per block.
    pub n_repair_packets: usize,
}

impl Default for FecParams {
    fn default() -> Self {
        Self {
            scheme: FecScheme::ReedSolomon,
            n_source_packets: DEFAULT_SOURCE_BLOCK,
            n_repair_packets: DEFAULT_REPAIR_BLOCK,
        }
    }
}

/// Per-session pipeline configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Latency the receiver steers towards.
    pub target_latency: Duration,
    /// Lower session-kill bound; defaults to half the target.
    pub min_latency: Option<Duration>,
    /// Upper session-kill bound; defaults to twice the target.
    pub max_latency: Option<Duration>,
    /// Watchdog: continuous silence beyond this is terminal.
    pub no_playback_timeout: Duration,
    /// Watchdog: width of the frame-status window.
    pub frame_status_window: Duration,
    /// Watchdog: broken-frame fraction within the window that kills.
    pub broken_threshold: f32,
    /// RTP stream validation limits.
    pub validator: ValidatorConfig,
    /// FEC parameters; `None` runs plain RTP.
    pub fec: Option<FecParams>,
    /// Resampler kernel; `None` disables resampling entirely, which
    /// requires the output rate to match the stream rate.
    pub resampler: Option<ResamplerConfig>,
    /// Per-channel samples per media packet; must match the sender.
    pub samples_per_packet: usize,
    /// Fill gaps with a quiet tone instead of silence.
    pub beep: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_latency: DEFAULT_TARGET_LATENCY,
            min_latency: None,
            max_latency: None,
            no_playback_timeout: DEFAULT_NO_PLAYBACK_TIMEOUT,
            frame_status_window: DEFAULT_BROKEN_WINDOW,
            broken_threshold: DEFAULT_BROKEN_THRESHOLD,
            validator: ValidatorConfig::default(),
            fec: None,
            resampler: Some(ResamplerConfig::default()),
            samples_per_packet: DEFAULT_PACKET_SAMPLES,
            beep: false,
        }
    }
}

/// Receiver-wide configuration.
#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    /// Template applied to every new session.
    pub session: SessionConfig,
    /// Per-channel samples per output frame.
    pub frame_size: usize,
    /// Output sample rate; `None` follows the stream rate.
    pub output_rate: Option<usize>,
    /// Concurrent session bound; further senders are ignored.
    pub max_sessions: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            frame_size: DEFAULT_FRAME_SIZE,
            output_rate: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl ReceiverConfig {
    /// Sets the template session configuration.
    #[must_use]
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Sets the output frame size in per-channel samples.
    #[must_use]
    pub fn frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Forces the output sample rate.
    #[must_use]
    pub fn output_rate(mut self, output_rate: Option<usize>) -> Self {
        self.output_rate = output_rate;
        self
    }

    /// Bounds the number of concurrent sessions.
    #[must_use]
    pub fn max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Rejects inconsistent combinations before anything is built.
    pub fn check(&self) -> Result<()> {
        self.session.check()?;
        if self.frame_size == 0 || self.frame_size > MAX_FRAME_SIZE {
            return Err(Error::IllegalConfig("frame size out of range"));
        }
        if self.max_sessions == 0 {
            return Err(Error::IllegalConfig("max sessions must be positive"));
        }
        Ok(())
    }
}

impl SessionConfig {
    /// Sets the target latency.
    #[must_use]
    pub fn target_latency(mut self, target_latency: Duration) -> Self {
        self.target_latency = target_latency;
        self
    }

    /// Sets the latency kill window.
    #[must_use]
    pub fn latency_window(mut self, min: Option<Duration>, max: Option<Duration>) -> Self {
        self.min_latency = min;
        self.max_latency = max;
        self
    }

    /// Sets the no-playback timeout.
    #[must_use]
    pub fn no_playback_timeout(mut self, timeout: Duration) -> Self {
        self.no_playback_timeout = timeout;
        self
    }

    /// Sets the FEC parameters.
    #[must_use]
    pub fn fec(mut self, fec: Option<FecParams>) -> Self {
        self.fec = fec;
        self
    }

    /// Sets the resampler kernel parameters.
    #[must_use]
    pub fn resampler(mut self, resampler: Option<ResamplerConfig>) -> Self {
        self.resampler = resampler;
        self
    }

    /// Sets the per-packet sample count.
    #[must_use]
    pub fn samples_per_packet(mut self, samples_per_packet: usize) -> Self {
        self.samples_per_packet = samples_per_packet;
        self
    }

    /// Effective minimum latency bound.
    #[must_use]
    pub fn effective_min_latency(&self) -> Duration {
        self.min_latency.unwrap_or(self.target_latency / 2)
    }

    /// Effective maximum latency bound.
    #[must_use]
    pub fn effective_max_latency(&self) -> Duration {
        self.max_latency.unwrap_or(self.target_latency * 2)
    }

    /// Rejects inconsistent combinations.
    pub fn check(&self) -> Result<()> {
        if self.target_latency.is_zero() {
            return Err(Error::IllegalConfig("target latency must be positive"));
        }
        if self.effective_min_latency() > self.target_latency
            || self.target_latency > self.effective_max_latency()
        {
            return Err(Error::IllegalConfig(
                "latency bounds must satisfy min <= target <= max",
            ));
        }
        if self.samples_per_packet == 0 {
            return Err(Error::IllegalConfig("samples per packet must be positive"));
        }
        if let Some(fec) = &self.fec {
            if fec.n_source_packets == 0 || fec.n_repair_packets == 0 {
                return Err(Error::IllegalConfig("fec block sizes must be positive"));
            }
        }
        if !(0.0..=1.0).contains(&self.broken_threshold) {
            return Err(Error::IllegalConfig("broken threshold must be a fraction"));
        }
        Ok(())
    }
}

/// Parse a human duration like `200ms`, `2s`, or `1m`.
///
/// Used by the CLI tools; accepts `ns`, `us`, `ms`, `s`, `m`, and `h`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration '{s}'"))?;
    let (num, unit) = s.split_at(split);
    let value: u64 = num.parse().map_err(|_| format!("bad duration '{s}'"))?;

    match unit {
        "ns" => Ok(Duration::from_nanos(value)),
        "us" => Ok(Duration::from_micros(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("unknown duration unit '{unit}'")),
    }
}

/// Sender-side configuration.
#[derive(Clone, Debug)]
pub struct SenderConfig {
    /// Payload type announced in outgoing packets.
    pub payload_type: u8,
    /// Per-channel samples per media packet.
    pub samples_per_packet: usize,
    /// FEC parameters; `None` sends plain RTP.
    pub fec: Option<FecParams>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            payload_type: 96,
            samples_per_packet: DEFAULT_PACKET_SAMPLES,
            fec: None,
        }
    }
}

impl SenderConfig {
    /// Sets the payload type.
    #[must_use]
    pub fn payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    /// Sets the FEC parameters.
    #[must_use]
    pub fn fec(mut self, fec: Option<FecParams>) -> Self {
        self.fec = fec;
        self
    }

    /// Rejects inconsistent combinations.
    pub fn check(&self) -> Result<()> {
        if self.samples_per_packet == 0 {
            return Err(Error::IllegalConfig("samples per packet must be positive"));
        }
        if let Some(fec) = &self.fec {
            if fec.n_source_packets == 0 || fec.n_repair_packets == 0 {
                return Err(Error::IllegalConfig("fec block sizes must be positive"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("200").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("2x").is_err());
    }

    #[test]
    fn latency_bounds_are_checked() {
        let config = SessionConfig::default()
            .target_latency(Duration::from_millis(100))
            .latency_window(Some(Duration::from_millis(200)), None);
        assert!(config.check().is_err());

        let config = SessionConfig::default()
            .target_latency(Duration::from_millis(100))
            .latency_window(Some(Duration::from_millis(50)), Some(Duration::from_millis(400)));
        assert!(config.check().is_ok());
    }
}
