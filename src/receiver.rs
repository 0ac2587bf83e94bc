//! Per-sender sessions and the dispatcher that owns them.
//!
//! The network context only ever touches a [`ReceiverHandle`]; parsed
//! packets cross into the audio context over a channel and every bit of
//! session state is driven from the audio thread's pull.

use crate::{
    audio::{
        Depacketizer, Frame, FrameFlags, FrameReader, LatencyConfig, LatencyMonitor, Playhead,
        Resampler, ScalingHandle, Watchdog, WatchdogConfig,
    },
    buffer::Pool,
    config::ReceiverConfig,
    constants::{MAX_PACKET_SIZE, PAYLOAD_ID_SIZE, RTP_HEADER_SIZE, SAMPLE_BYTE_SIZE},
    error::Result,
    fec::{new_decoder, FecConfig, FecReader},
    packet::{PacketFlags, PacketPtr, PacketReader, Parser, Router, SortedQueue},
    rtp::{Breaker, FormatMap, Validator},
};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tracing::{debug, info, trace, warn};

/// Network-side handle: push parsed packets towards the sessions.
#[derive(Clone)]
pub struct ReceiverHandle {
    tx: flume::Sender<PacketPtr>,
}

impl ReceiverHandle {
    /// Enqueue one packet; silently dropped once the receiver is gone.
    pub fn write(&self, packet: PacketPtr) {
        let _ = self.tx.send(packet);
    }
}

/// Dispatcher and mixer: owns every live [`Session`], pulls their frames,
/// and reaps the dead on each tick.
pub struct Receiver {
    config: ReceiverConfig,
    formats: FormatMap,
    output_channels: usize,
    rx: flume::Receiver<PacketPtr>,
    tx: flume::Sender<PacketPtr>,
    sessions: HashMap<SocketAddr, Session>,
    byte_pool: Pool<u8>,
    scratch: Frame,
    /// Sample clock: per-channel output samples produced so far.
    now: u64,
    had_session: bool,
    n_dropped_unroutable: u64,
    n_rejected_sessions: u64,
}

impl Receiver {
    /// Validate `config` and build an empty receiver.
    pub fn new(config: ReceiverConfig, formats: FormatMap) -> Result<Self> {
        config.check()?;

        let (tx, rx) = flume::unbounded();
        let fec_scratch = config
            .session
            .fec
            .map_or(4, |f| 2 * (f.n_source_packets + f.n_repair_packets));
        let frame_samples = config.frame_size * crate::constants::DEFAULT_CHANNELS;

        Ok(Self {
            scratch: Frame::silent(frame_samples),
            byte_pool: Pool::new(MAX_PACKET_SIZE, fec_scratch.max(8) * config.max_sessions),
            config,
            formats,
            output_channels: crate::constants::DEFAULT_CHANNELS,
            rx,
            tx,
            sessions: HashMap::new(),
            now: 0,
            had_session: false,
            n_dropped_unroutable: 0,
            n_rejected_sessions: 0,
        })
    }

    /// Handle for the network context.
    #[must_use]
    pub fn handle(&self) -> ReceiverHandle {
        ReceiverHandle {
            tx: self.tx.clone(),
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// True once any session has ever existed (oneshot support).
    #[must_use]
    pub fn had_session(&self) -> bool {
        self.had_session
    }

    /// Buffered latency of every session that has started playing, in
    /// stream samples. Diagnostic surface; the tests watch convergence
    /// through it.
    #[must_use]
    pub fn session_latencies(&self) -> Vec<i32> {
        self.sessions
            .values()
            .filter_map(|s| s.monitor.latency())
            .collect()
    }

    fn dispatch(&mut self) {
        let packets: Vec<PacketPtr> = self.rx.drain().collect();
        for packet in packets {
            let addr = packet.addr();
            if let Some(session) = self.sessions.get_mut(&addr) {
                session.handle(packet, self.now);
                continue;
            }

            // Only a source packet can introduce a sender; a repair
            // packet carries no payload type to build a session from.
            if packet.rtp().is_none() {
                trace!("dropping repair packet from unknown sender {addr}");
                self.n_dropped_unroutable += 1;
                continue;
            }

            if self.sessions.len() >= self.config.max_sessions {
                warn!("session limit reached, ignoring sender {addr}");
                self.n_rejected_sessions += 1;
                continue;
            }

            match Session::new(
                &packet,
                &self.config,
                &self.formats,
                self.byte_pool.clone(),
                self.output_channels,
                self.now,
            ) {
                Some(mut session) => {
                    info!("new session for {addr}");
                    session.handle(packet, self.now);
                    self.sessions.insert(addr, session);
                    self.had_session = true;
                },
                None => {
                    self.n_dropped_unroutable += 1;
                },
            }
        }
    }

    /// Produce one output frame: the mix of every live session, silence
    /// when nobody is talking.
    pub fn read(&mut self, frame: &mut Frame) {
        self.dispatch();

        frame.clear();
        frame.flags = FrameFlags::EMPTY;
        frame.timestamp = self.now;

        let mut scratch = std::mem::take(&mut self.scratch);
        let mut first = true;
        for session in self.sessions.values_mut() {
            scratch.clear();
            session.read(&mut scratch);

            if first {
                frame.flags = scratch.flags;
                first = false;
            } else {
                frame.flags = frame.flags.with(scratch.flags);
            }
            for (out, s) in frame.samples.iter_mut().zip(scratch.samples.iter()) {
                *out = (*out + s).clamp(-1.0, 1.0);
            }
        }
        self.scratch = scratch;

        self.now += (frame.samples.len() / self.output_channels) as u64;
    }

    /// One scheduler tick: drive per-session watchdogs and latency
    /// monitors, destroy whatever reports terminal failure or idled out.
    pub fn update(&mut self) {
        self.dispatch();

        let now = self.now;
        self.sessions.retain(|addr, session| {
            let keep = session.update(now);
            if !keep {
                info!("destroying session for {addr}");
            }
            keep
        });
    }
}

/// One per-sender pipeline: router, queues, and the reader chain, with
/// the watchdog as terminal reader.
struct Session {
    router: Router,
    watchdog: Watchdog,
    monitor: LatencyMonitor,
    breaker: Arc<Breaker>,
    last_packet: u64,
    idle_timeout: u64,
}

impl Session {
    /// Assemble the full chain for the sender of `packet`. Any stage
    /// failing to construct aborts the session; no partial pipelines.
    fn new(
        packet: &PacketPtr,
        config: &ReceiverConfig,
        formats: &FormatMap,
        byte_pool: Pool<u8>,
        output_channels: usize,
        now: u64,
    ) -> Option<Session> {
        let rtp = packet.rtp()?;
        let session_config = &config.session;

        let Some(format) = formats.find(rtp.payload_type) else {
            debug!("no format for payload type {}", rtp.payload_type);
            return None;
        };
        if format.channels != output_channels {
            debug!("format {} does not match output channel count", format.name);
            return None;
        }

        let rate = format.sample_rate;
        let output_rate = config.output_rate.unwrap_or(rate);
        let to_samples =
            |d: Duration| -> u32 { (d.as_secs_f64() * rate as f64).round() as u32 };

        let mut router = Router::new();

        let source_queue = SortedQueue::new(None);
        router.add_route(PacketFlags::AUDIO, Arc::clone(&source_queue));

        let breaker = Breaker::new();

        let mut preader: Box<dyn PacketReader> = Box::new(Arc::clone(&source_queue));
        preader = Box::new(crate::packet::DelayedReader::new(
            preader,
            to_samples(session_config.target_latency),
            format.channels,
        ));
        preader = Box::new(Validator::new(
            preader,
            rtp.payload_type,
            session_config.validator,
            Arc::clone(&breaker),
        ));

        if let Some(fec) = &session_config.fec {
            let repair_queue = SortedQueue::new(None);
            router.add_route(PacketFlags::REPAIR, Arc::clone(&repair_queue));

            let payload_size = RTP_HEADER_SIZE
                + PAYLOAD_ID_SIZE
                + session_config.samples_per_packet * format.channels * SAMPLE_BYTE_SIZE;
            let fec_config = FecConfig {
                scheme: fec.scheme,
                n_source_packets: fec.n_source_packets,
                n_repair_packets: fec.n_repair_packets,
                payload_size,
                ..FecConfig::default()
            };

            let decoder = new_decoder(&fec_config, byte_pool)?;
            preader = Box::new(FecReader::new(
                &fec_config,
                decoder,
                preader,
                Box::new(repair_queue),
                Parser::new(fec.scheme.source_protocol()),
                packet.addr(),
            ));
            preader = Box::new(Validator::new(
                preader,
                rtp.payload_type,
                session_config.validator,
                Arc::clone(&breaker),
            ));
        }

        let playhead = Playhead::new();
        let mut freader: Box<dyn FrameReader> = Box::new(Depacketizer::new(
            preader,
            format.new_decoder(),
            format.channels,
            rate,
            session_config.beep,
            Arc::clone(&playhead),
        ));

        let mut scaling = None;
        match &session_config.resampler {
            Some(resampler_config) => {
                let handle = ScalingHandle::new();
                freader = Box::new(Resampler::new(
                    freader,
                    resampler_config,
                    format.channels,
                    config.frame_size,
                    rate,
                    output_rate,
                    Arc::clone(&handle),
                ));
                scaling = Some(handle);
            },
            None if output_rate != rate => {
                warn!("resampling disabled but {rate} != {output_rate}");
                return None;
            },
            None => {},
        }

        let watchdog = Watchdog::new(
            freader,
            format.channels,
            WatchdogConfig {
                no_playback_timeout: to_samples(session_config.no_playback_timeout),
                frame_status_window: (to_samples(session_config.frame_status_window) as usize)
                    / config.frame_size.max(1),
                broken_threshold: session_config.broken_threshold,
            },
        );

        let target = to_samples(session_config.target_latency);
        let monitor = LatencyMonitor::new(
            source_queue,
            playhead,
            scaling,
            LatencyConfig {
                target_latency: target,
                min_latency: to_samples(session_config.effective_min_latency()),
                max_latency: to_samples(session_config.effective_max_latency()),
                grace: target,
                packet_duration: session_config.samples_per_packet as u32,
            },
        );

        Some(Session {
            router,
            watchdog,
            monitor,
            breaker,
            last_packet: now,
            idle_timeout: 2 * u64::from(to_samples(session_config.no_playback_timeout)),
        })
    }

    fn handle(&mut self, packet: PacketPtr, now: u64) {
        self.last_packet = now;
        self.router.write(packet);
    }

    fn read(&mut self, frame: &mut Frame) {
        self.watchdog.read(frame);
    }

    fn update(&mut self, now: u64) -> bool {
        if self.breaker.tripped() {
            return false;
        }
        if !self.watchdog.update() {
            return false;
        }
        if !self.monitor.update(now) {
            return false;
        }
        if self.idle_timeout > 0 && now.saturating_sub(self.last_packet) > self.idle_timeout {
            debug!("session idle for {} samples", now - self.last_packet);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::Sample,
        config::SessionConfig,
        packet::{Packet, RtpHeader},
        rtp::encode_l16,
    };
    use bytes::Bytes;
    use std::time::Duration;

    const SPP: usize = 32;
    const CH: usize = 2;

    fn test_config() -> ReceiverConfig {
        ReceiverConfig::default()
            .frame_size(SPP)
            .session(
                SessionConfig::default()
                    .samples_per_packet(SPP)
                    .target_latency(Duration::from_millis(10))
                    .resampler(None),
            )
    }

    fn source_packet(addr: &str, source: u32, seqnum: u16, timestamp: u32) -> PacketPtr {
        let samples = vec![0.1 as Sample; SPP * CH];
        let mut payload = Vec::new();
        encode_l16(&samples, &mut payload);
        Packet::new(
            PacketFlags::AUDIO,
            Some(RtpHeader {
                source,
                seqnum,
                timestamp,
                payload_type: 96,
                marker: false,
            }),
            None,
            Bytes::new(),
            Bytes::from(payload),
            addr.parse().unwrap(),
        )
    }

    #[test]
    fn session_created_per_source_address() {
        let mut receiver = Receiver::new(test_config(), FormatMap::default()).unwrap();
        let handle = receiver.handle();

        for i in 0..4u16 {
            handle.write(source_packet("10.0.0.1:5000", 7, i, u32::from(i) * SPP as u32));
            handle.write(source_packet("10.0.0.2:5000", 9, i, u32::from(i) * SPP as u32));
        }

        let mut frame = Frame::silent(SPP * CH);
        receiver.read(&mut frame);
        assert_eq!(receiver.session_count(), 2);
        assert!(receiver.had_session());
    }

    #[test]
    fn session_limit_is_enforced() {
        let config = test_config().max_sessions(1);
        let mut receiver = Receiver::new(config, FormatMap::default()).unwrap();
        let handle = receiver.handle();

        handle.write(source_packet("10.0.0.1:5000", 7, 0, 0));
        handle.write(source_packet("10.0.0.2:5000", 9, 0, 0));

        let mut frame = Frame::silent(SPP * CH);
        receiver.read(&mut frame);
        assert_eq!(receiver.session_count(), 1);
        assert_eq!(receiver.n_rejected_sessions, 1);
    }

    #[test]
    fn unknown_payload_type_is_ignored() {
        let mut receiver = Receiver::new(test_config(), FormatMap::default()).unwrap();
        let handle = receiver.handle();

        let samples = vec![0.0 as Sample; SPP * CH];
        let mut payload = Vec::new();
        encode_l16(&samples, &mut payload);
        handle.write(Packet::new(
            PacketFlags::AUDIO,
            Some(RtpHeader {
                source: 7,
                seqnum: 0,
                timestamp: 0,
                payload_type: 111,
                marker: false,
            }),
            None,
            Bytes::new(),
            Bytes::from(payload),
            "10.0.0.1:5000".parse().unwrap(),
        ));

        let mut frame = Frame::silent(SPP * CH);
        receiver.read(&mut frame);
        assert_eq!(receiver.session_count(), 0);
        assert_eq!(receiver.n_dropped_unroutable, 1);
    }

    #[test]
    fn source_id_change_destroys_and_recreates_session() {
        let mut receiver = Receiver::new(test_config(), FormatMap::default()).unwrap();
        let handle = receiver.handle();
        let mut frame = Frame::silent(SPP * CH);

        // Enough to start playback (target 10ms = 441 samples at 44.1k).
        for i in 0..20u16 {
            handle.write(source_packet("10.0.0.1:5000", 7, i, u32::from(i) * SPP as u32));
        }
        for _ in 0..8 {
            receiver.read(&mut frame);
        }
        assert_eq!(receiver.session_count(), 1);

        // New source id from the same address: the validator trips once
        // playback reaches the offending packet.
        handle.write(source_packet("10.0.0.1:5000", 8, 20, 20 * SPP as u32));
        for _ in 0..16 {
            receiver.read(&mut frame);
        }
        receiver.update();
        assert_eq!(receiver.session_count(), 0);

        // The next packet builds a fresh session.
        handle.write(source_packet("10.0.0.1:5000", 8, 100, 0));
        receiver.read(&mut frame);
        assert_eq!(receiver.session_count(), 1);
    }

    #[test]
    fn idle_session_is_reaped() {
        let mut receiver = Receiver::new(test_config(), FormatMap::default()).unwrap();
        let handle = receiver.handle();
        handle.write(source_packet("10.0.0.1:5000", 7, 0, 0));

        let mut frame = Frame::silent(SPP * CH);
        receiver.read(&mut frame);
        assert_eq!(receiver.session_count(), 1);

        // 2 * no_playback_timeout of silence; the idle reaper wins the
        // race against the watchdog only if no frames are read, so tick
        // the clock by reading frames and assert the session dies.
        let idle_frames = 2 * 2 * 44_100 / SPP + 2;
        for _ in 0..idle_frames {
            receiver.read(&mut frame);
        }
        receiver.update();
        assert_eq!(receiver.session_count(), 0);
    }
}
