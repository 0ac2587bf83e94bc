//! Constants affecting pipeline function and wire handling.

use std::time::Duration;

/// Default session sample rate when no payload format overrides it.
pub const DEFAULT_SAMPLE_RATE: usize = 44_100;

/// Default channel count for the built-in payload formats.
pub const DEFAULT_CHANNELS: usize = 2;

/// Number of per-channel samples carried by one media packet.
///
/// Must match between sender and receiver for a FEC-protected stream,
/// since the symbol size is derived from it.
pub const DEFAULT_PACKET_SAMPLES: usize = 320;

/// Number of per-channel samples in one output frame.
pub const DEFAULT_FRAME_SIZE: usize = 320;

/// Size of the RTP header we produce and accept (no CSRC list).
pub const RTP_HEADER_SIZE: usize = 12;

/// Size of the FECFRAME payload ID (sbn + k + esi).
pub const PAYLOAD_ID_SIZE: usize = 8;

/// The one (and only) RTP version.
pub const RTP_VERSION: u8 = 2;

/// Maximum UDP datagram we will parse or compose.
pub const MAX_PACKET_SIZE: usize = 2048;

/// Maximum sample buffer vended by the frame pool.
pub const MAX_FRAME_SIZE: usize = 8192;

/// Bytes per encoded sample of the built-in L16 formats.
pub const SAMPLE_BYTE_SIZE: usize = 2;

/// Default playback latency the receiver aims to keep buffered.
pub const DEFAULT_TARGET_LATENCY: Duration = Duration::from_millis(200);

/// Default watchdog cutoff for a session that produces only empty frames.
pub const DEFAULT_NO_PLAYBACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Default sliding window over which frame breakage is assessed.
pub const DEFAULT_BROKEN_WINDOW: Duration = Duration::from_secs(2);

/// Fraction of broken frames within the window that kills a session.
pub const DEFAULT_BROKEN_THRESHOLD: f32 = 0.5;

/// Default number of source packets per FEC block.
pub const DEFAULT_SOURCE_BLOCK: usize = 20;

/// Default number of repair packets per FEC block.
pub const DEFAULT_REPAIR_BLOCK: usize = 10;

/// Largest tolerated forward jump in RTP sequence numbers.
pub const DEFAULT_MAX_SN_JUMP: u16 = 100;

/// Largest tolerated forward jump in RTP timestamps, in samples.
pub const DEFAULT_MAX_TS_JUMP: u32 = 44_100;

/// How many blocks ahead of the current one the FEC reader may observe
/// before it force-closes the current block.
pub const DEFAULT_MAX_BLOCK_BACKLOG: u32 = 3;

/// Blocks whose number jumps further than this are dropped as garbage.
pub const DEFAULT_MAX_SBN_JUMP: u32 = 100;

/// Default bound on concurrently live sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 8;
