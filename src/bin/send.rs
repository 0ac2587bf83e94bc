//! `waxwing-send`: stream a WAV file or a test tone to a receiver.

use anyhow::{bail, Context};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use structopt::StructOpt;
use tokio::net::UdpSocket;
use tracing::info;
use waxwing::{
    config::FecParams,
    fec::FecScheme,
    net,
    rtp::FormatMap,
    sndio::{SampleSource, ToneSource, WavSource},
    Sender, SenderConfig,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "waxwing-send", about = "Send a waxwing audio stream over UDP.")]
struct Opt {
    /// Destination address for source packets (host:port)
    #[structopt(long)]
    source: SocketAddr,

    /// Destination address for repair packets (required with FEC)
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

    /// RTP payload type (96 = 44.1 kHz stereo, 97 = 48 kHz stereo)
    #[structopt(long, default_value = "96")]
    pt: u8,

    /// Per-channel samples per media packet
    #[structopt(long, default_value = "320")]
    packet_samples: usize,

    /// Input WAV file; a test tone is sent when omitted
    #[structopt(long, parse(from_os_str))]
    input: Option<PathBuf>,

    /// Test tone frequency in Hz
    #[structopt(long, default_value = "440")]
    tone: f64,

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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    init_logging(opt.verbose);

    let fec = match opt.fec.as_str() {
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

    if fec.is_none() && (opt.nbsrc.is_some() || opt.nbrpr.is_some()) {
        bail!("--nbsrc/--nbrpr can't be used when --fec=none");
    }
    let repair_dest = match (&fec, opt.repair) {
        (Some(_), Some(repair)) => repair,
        (Some(_), None) => bail!("--repair is required when FEC is enabled"),
        (None, _) => opt.source,
    };

    let config = SenderConfig {
        payload_type: opt.pt,
        samples_per_packet: opt.packet_samples,
        fec,
    };

    let (mut sender, datagrams) =
        Sender::new(&config, &FormatMap::default(), opt.source, repair_dest)
            .context("sender pipeline")?;

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("binding send socket")?;
    tokio::spawn(net::send_loop(datagrams, socket, opt.source, repair_dest));

    let rate = sender.sample_rate();
    let channels = sender.channels();
    let mut source: Box<dyn SampleSource> = match &opt.input {
        Some(path) => Box::new(
            WavSource::open(path, rate, channels)
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Box::new(ToneSource::new(rate, channels, opt.tone)),
    };

    info!("streaming to {} at {rate} Hz", opt.source);

    let packet_duration =
        Duration::from_secs_f64(sender.samples_per_packet() as f64 / rate as f64);
    let mut interval = tokio::time::interval(packet_duration);
    let mut chunk = vec![0.0f32; sender.samples_per_packet() * channels];

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let more = source.read(&mut chunk);
                sender.write(&chunk);
                if !more {
                    info!("input exhausted");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            },
        }
    }

    // Dropping the sender closes the datagram channel; give the send
    // loop a moment to flush what is already queued.
    drop(sender);
    tokio::time::sleep(Duration::from_millis(50)).await;

    Ok(())
}
