//! Block erasure coding: codec contract, codecs, and the block
//! assembly/disassembly state machines.

mod ldpc;
mod reader;
mod rs;
mod writer;

pub use self::{
    ldpc::{LdpcDecoder, LdpcEncoder},
    reader::{FecReader, FecStats},
    rs::{RsDecoder, RsEncoder},
    writer::FecWriter,
};

use crate::{
    buffer::Pool,
    constants::{
        DEFAULT_MAX_BLOCK_BACKLOG, DEFAULT_MAX_SBN_JUMP, DEFAULT_REPAIR_BLOCK,
        DEFAULT_SOURCE_BLOCK,
    },
    packet::Protocol,
};
use bytes::Bytes;

/// Erasure code family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FecScheme {
    /// Reed-Solomon over GF(2^8); optimal.
    ReedSolomon,
    /// LDPC-Staircase; non-optimal, cheap for large blocks.
    LdpcStaircase,
}

impl FecScheme {
    /// Wire layout of the source sub-stream for this scheme.
    #[must_use]
    pub fn source_protocol(self) -> Protocol {
        match self {
            FecScheme::ReedSolomon => Protocol::RtpRsSource,
            FecScheme::LdpcStaircase => Protocol::RtpLdpcSource,
        }
    }

    /// Wire layout of the repair sub-stream for this scheme.
    #[must_use]
    pub fn repair_protocol(self) -> Protocol {
        match self {
            FecScheme::ReedSolomon => Protocol::RsRepair,
            FecScheme::LdpcStaircase => Protocol::LdpcRepair,
        }
    }
}

/// Block shape and codec parameters, shared by sender and receiver.
#[derive(Clone, Copy, Debug)]
pub struct FecConfig {
    /// Which codec protects the stream.
    pub scheme: FecScheme,
    /// Source symbols per block (`sblen`).
    pub n_source_packets: usize,
    /// Repair symbols per block (`rblen`).
    pub n_repair_packets: usize,
    /// Fixed symbol size in bytes; every source datagram must have
    /// exactly this size.
    pub payload_size: usize,
    /// Seed of the deterministic LDPC equation layout.
    pub ldpc_prng_seed: u32,
    /// Ones per source column in the LDPC parity matrix.
    pub ldpc_n1: usize,
    /// Blocks the reader may see ahead before force-closing the current.
    pub max_block_backlog: u32,
    /// Block-number jumps beyond this are discarded as garbage.
    pub max_sbn_jump: u32,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            scheme: FecScheme::ReedSolomon,
            n_source_packets: DEFAULT_SOURCE_BLOCK,
            n_repair_packets: DEFAULT_REPAIR_BLOCK,
            payload_size: 0,
            ldpc_prng_seed: 1_297_501_556,
            ldpc_n1: 3,
            max_block_backlog: DEFAULT_MAX_BLOCK_BACKLOG,
            max_sbn_jump: DEFAULT_MAX_SBN_JUMP,
        }
    }
}

/// Receiver-side erasure engine for one block at a time.
///
/// Indices `0..sblen` are source positions, `sblen..sblen+rblen` repair
/// positions. Violating an operation's preconditions (index bounds,
/// symbol size, double-set) is a programmer error and panics.
pub trait BlockDecoder: Send {
    /// Configure for a block of this shape. Idempotent for an unchanged
    /// shape; returns false when internal tables cannot be (re)sized.
    fn begin(&mut self, sblen: usize, rblen: usize) -> bool;

    /// Register a received symbol. May trigger incremental decoding.
    fn set(&mut self, index: usize, symbol: Bytes);

    /// The symbol at `index`, received or reconstructed, or `None` while
    /// it cannot be reconstructed yet. Returned buffers are caller-owned
    /// and survive [`BlockDecoder::end`].
    fn repair(&mut self, index: usize) -> Option<Bytes>;

    /// Tear down block state and release internal buffers.
    fn end(&mut self);

    /// True when any `sblen` received symbols suffice to reconstruct
    /// every source symbol.
    fn is_optimal(&self) -> bool;
}

/// Sender-side erasure engine for one block at a time.
pub trait BlockEncoder: Send {
    /// Configure for a block of this shape; same contract as the decoder.
    fn begin(&mut self, sblen: usize, rblen: usize) -> bool;

    /// Register source symbol `index` (`0..sblen`).
    fn set(&mut self, index: usize, symbol: Bytes);

    /// Compute all repair symbols. Every source symbol must be set.
    fn fill(&mut self);

    /// Fetch repair symbol `index` (`sblen..sblen+rblen`) after
    /// [`BlockEncoder::fill`]. `None` on scratch-pool exhaustion.
    fn repair(&mut self, index: usize) -> Option<Bytes>;

    /// Tear down block state.
    fn end(&mut self);
}

/// Instantiate the decoder for `config`, drawing scratch from `pool`.
///
/// Fails when the pool's buffers cannot hold a symbol.
#[must_use]
pub fn new_decoder(config: &FecConfig, pool: Pool<u8>) -> Option<Box<dyn BlockDecoder>> {
    if pool.buffer_len() < config.payload_size {
        return None;
    }

    Some(match config.scheme {
        FecScheme::ReedSolomon => Box::new(RsDecoder::new(config.payload_size, pool)),
        FecScheme::LdpcStaircase => Box::new(LdpcDecoder::new(
            config.payload_size,
            config.ldpc_prng_seed,
            config.ldpc_n1,
            pool,
        )),
    })
}

/// Instantiate the encoder for `config`, drawing scratch from `pool`.
#[must_use]
pub fn new_encoder(config: &FecConfig, pool: Pool<u8>) -> Option<Box<dyn BlockEncoder>> {
    if pool.buffer_len() < config.payload_size {
        return None;
    }

    Some(match config.scheme {
        FecScheme::ReedSolomon => Box::new(RsEncoder::new(config.payload_size, pool)),
        FecScheme::LdpcStaircase => Box::new(LdpcEncoder::new(
            config.payload_size,
            config.ldpc_prng_seed,
            config.ldpc_n1,
            pool,
        )),
    })
}
