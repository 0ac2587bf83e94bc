#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
//! Waxwing is a real-time audio transport for lossy packet networks,
//! written in Rust. It streams continuous PCM over UDP from a sender to
//! a receiver with bounded latency, and offers:
//!  * RTP packetization with per-sender sessions, stream validation,
//!    and duplicate/jitter-absorbing sorted queues.
//!  * Block erasure protection (FECFRAME-style) with Reed-Solomon over
//!    GF(2^8) or LDPC-Staircase codecs, recovering lost packets without
//!    retransmission.
//!  * An adaptive windowed-sinc resampler slaved to a latency monitor,
//!    cancelling sender/receiver clock drift.
//!  * Watchdogs that tell transient loss apart from dead streams.
//!
//! The receiver pipeline is a pull-driven chain: the audio sink pulls
//! frames from the session's terminal reader, the pull propagates
//! through resampler and depacketizer down to the sorted queues where
//! it meets packets pushed by the network context.
//!
//! The `waxwing-recv` and `waxwing-send` binaries wrap the library in a
//! command-line tool pair.

#![warn(clippy::pedantic, rust_2018_idioms)]
#![allow(
    // Allowed as they are too pedantic
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::too_many_lines,
    clippy::cast_lossless,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
)]

pub mod audio;
pub mod buffer;
pub mod config;
pub mod constants;
pub mod error;
pub mod fec;
pub mod net;
pub mod packet;
pub mod receiver;
pub mod rtp;
pub mod sender;
pub mod sndio;

pub use config::{ReceiverConfig, SenderConfig, SessionConfig};
pub use error::{Error, Result};
pub use receiver::{Receiver, ReceiverHandle};
pub use sender::Sender;
