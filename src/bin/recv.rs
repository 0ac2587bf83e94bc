//! `waxwing-recv`: receive an RTP/FEC audio stream and write it to a
//! file sink.

use anyhow::{bail, Context};
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use structopt::StructOpt;
use tokio::net::UdpSocket;
use tracing::info;
use waxwing::{
    audio::{ResamplerConfig, ResamplerProfile},
    config::{parse_duration, FecParams},
    constants::{DEFAULT_CHANNELS, DEFAULT_FRAME_SIZE, DEFAULT_SAMPLE_RATE},
    fec::FecScheme,
    net,
    packet::{Parser, Protocol},
    rtp::FormatMap,
    sndio::{open_sink, Player},
    Receiver, ReceiverConfig, SessionConfig,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "waxwing-recv", about = "Receive a waxwing audio stream over UDP.")]
struct Opt {
    /// UDP bind address for source packets (host:port)
    #[structopt(long)]
    source: SocketAddr,

    /// UDP bind address for repair packets (required with FEC)
    #[structopt(long)]
    repair: Option<SocketAddr>,

    /// FEC codec: none, rs or ldpc
    #[structopt(long, default_value = "none")]
    fec: String,

    /// Source packets per FEC block
    #[structopt(long)]
    nbsrc: Option<usize>,

    /// Repair packets per FEC block
    #[structopt(long)]
    nbrpr: Option<usize>,

    /// Target playback latency (e.g. 200ms)
    #[structopt(long, parse(try_from_str = parse_duration))]
    latency: Option<Duration>,

    /// Minimum tolerated latency before the session dies
    #[structopt(long, parse(try_from_str = parse_duration))]
    min_latency: Option<Duration>,

    /// Maximum tolerated latency before the session dies
    #[structopt(long, parse(try_from_str = parse_duration))]
    max_latency: Option<Duration>,

    /// Kill a session after this much continuous silence
    #[structopt(long, parse(try_from_str = parse_duration))]
    np_timeout: Option<Duration>,

    /// Tolerated amount of broken playback within the detection window
    #[structopt(long, parse(try_from_str = parse_duration))]
    bp_timeout: Option<Duration>,

    /// Width of the breakage detection window
    #[structopt(long, parse(try_from_str = parse_duration))]
    bp_window: Option<Duration>,

    /// Force the output sample rate
    #[structopt(long)]
    rate: Option<usize>,

    /// Resampler quality: low, medium or high
    #[structopt(long, default_value = "medium")]
    resampler_profile: String,

    /// Override the resampler interpolation table resolution
    #[structopt(long)]
    resampler_interp: Option<usize>,

    /// Override the resampler window size (taps per side)
    #[structopt(long)]
    resampler_window: Option<usize>,

    /// Disable resampling entirely (stream rate must match output rate)
    #[structopt(long)]
    no_resampling: bool,

    /// Per-channel samples per media packet; must match the sender
    #[structopt(long, default_value = "320")]
    packet_samples: usize,

    /// Output file path
    #[structopt(long, parse(from_os_str))]
    output: PathBuf,

    /// Sink driver: wav or raw
    #[structopt(long = "type", default_value = "wav")]
    sink_type: String,

    /// Fill dropouts with a quiet tone instead of silence
    #[structopt(long)]
    beep: bool,

    /// Exit once all sessions have ended
    #[structopt(long)]
    oneshot: bool,

    /// Bound on concurrent sessions
    #[structopt(long, default_value = "8")]
    max_sessions: usize,

    /// Increase verbosity (-v debug, -vv trace)
    #[structopt(short, parse(from_occurrences))]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn session_config(opt: &Opt) -> anyhow::Result<SessionConfig> {
    let mut session = SessionConfig::default();

    if let Some(latency) = opt.latency {
        session.target_latency = latency;
    }
    session.min_latency = opt.min_latency;
    session.max_latency = opt.max_latency;
    if let Some(timeout) = opt.np_timeout {
        session.no_playback_timeout = timeout;
    }
    if let Some(window) = opt.bp_window {
        session.frame_status_window = window;
    }
    if let Some(timeout) = opt.bp_timeout {
        // The tolerated amount of breakage, as a fraction of the window.
        let window = session.frame_status_window.as_secs_f64();
        session.broken_threshold = (timeout.as_secs_f64() / window).clamp(0.0, 1.0) as f32;
    }
    session.samples_per_packet = opt.packet_samples;
    session.beep = opt.beep;

    session.fec = match opt.fec.as_str() {
        "none" => None,
        "rs" => Some(FecScheme::ReedSolomon),
        "ldpc" => Some(FecScheme::LdpcStaircase),
        other => bail!("unknown FEC codec '{other}'"),
    }
    .map(|scheme| {
        let mut fec = FecParams {
            scheme,
            ..FecParams::default()
        };
        if let Some(nbsrc) = opt.nbsrc {
            fec.n_source_packets = nbsrc;
        }
        if let Some(nbrpr) = opt.nbrpr {
            fec.n_repair_packets = nbrpr;
        }
        fec
    });

    if session.fec.is_none() && (opt.nbsrc.is_some() || opt.nbrpr.is_some()) {
        bail!("--nbsrc/--nbrpr can't be used when --fec=none");
    }

    session.resampler = if opt.no_resampling {
        None
    } else {
        let mut resampler = match opt.resampler_profile.as_str() {
            "low" => ResamplerProfile::Low.config(),
            "medium" => ResamplerProfile::Medium.config(),
            "high" => ResamplerProfile::High.config(),
            other => bail!("unknown resampler profile '{other}'"),
        };
        if let Some(interp) = opt.resampler_interp {
            resampler = ResamplerConfig {
                window_interp: interp,
                ..resampler
            };
        }
        if let Some(window) = opt.resampler_window {
            resampler = ResamplerConfig {
                window_size: window,
                ..resampler
            };
        }
        Some(resampler)
    };

    Ok(session)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    init_logging(opt.verbose);

    let session = session_config(&opt)?;
    let fec_scheme = session.fec.map(|f| f.scheme);

    if fec_scheme.is_some() && opt.repair.is_none() {
        bail!("--repair is required when FEC is enabled");
    }

    let output_rate = opt.rate.unwrap_or(DEFAULT_SAMPLE_RATE);
    let config = ReceiverConfig::default()
        .session(session)
        .frame_size(DEFAULT_FRAME_SIZE)
        .output_rate(Some(output_rate))
        .max_sessions(opt.max_sessions);

    let receiver = Receiver::new(config, FormatMap::default()).context("receiver pipeline")?;
    let handle = receiver.handle();

    let source_proto = match fec_scheme {
        None => Protocol::Rtp,
        Some(scheme) => scheme.source_protocol(),
    };
    let source_socket = UdpSocket::bind(opt.source)
        .await
        .with_context(|| format!("binding source port {}", opt.source))?;
    info!("listening for source packets on {}", opt.source);
    tokio::spawn(net::receive_loop(
        source_socket,
        Parser::new(source_proto),
        handle.clone(),
    ));

    if let Some(scheme) = fec_scheme {
        let repair = opt.repair.expect("checked above");
        let repair_socket = UdpSocket::bind(repair)
            .await
            .with_context(|| format!("binding repair port {repair}"))?;
        info!("listening for repair packets on {repair}");
        tokio::spawn(net::receive_loop(
            repair_socket,
            Parser::new(scheme.repair_protocol()),
            handle,
        ));
    }

    let sink = open_sink(&opt.output, &opt.sink_type, output_rate, DEFAULT_CHANNELS)
        .context("opening output")?;

    let stop = Arc::new(AtomicBool::new(false));
    let player = Player::new(
        receiver,
        sink,
        DEFAULT_FRAME_SIZE,
        DEFAULT_CHANNELS,
        output_rate,
        opt.oneshot,
        Arc::clone(&stop),
    );

    let mut player_task = tokio::task::spawn_blocking(move || player.run());

    tokio::select! {
        res = &mut player_task => {
            res.context("player thread")?.context("audio sink")?;
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            stop.store(true, Ordering::Release);
            player_task.await.context("player thread")?.context("audio sink")?;
        },
    }

    Ok(())
}
