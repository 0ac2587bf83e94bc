//! Payload-type registry: maps the RTP `payload_type` field to a sample
//! format and a decoder for it.

use crate::audio::Sample;
use byteorder::{BigEndian, ByteOrder};

/// Decodes one packet payload into interleaved samples.
///
/// The registry owns construction; the depacketizer owns the instance.
/// Implementations append to `out` and must tolerate arbitrary payload
/// bytes from the network.
pub trait Decoder: Send {
    /// Decode `payload`, appending interleaved samples to `out`.
    /// Returns false when the payload is malformed for this codec.
    fn decode(&mut self, payload: &[u8], out: &mut Vec<Sample>) -> bool;
}

/// One entry of the payload-type registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Format {
    /// RTP payload type this format answers to.
    pub payload_type: u8,
    /// Stream sample rate in Hz.
    pub sample_rate: usize,
    /// Interleaved channel count.
    pub channels: usize,
    /// Human-readable codec name for logs.
    pub name: &'static str,
}

impl Format {
    /// Instantiate the decoder for this format.
    #[must_use]
    pub fn new_decoder(&self) -> Box<dyn Decoder> {
        // All built-in formats are L16; plug-in codecs dispatch here.
        Box::new(L16Decoder {
            channels: self.channels,
        })
    }
}

/// The payload-type registry.
#[derive(Clone, Debug)]
pub struct FormatMap {
    formats: Vec<Format>,
}

impl Default for FormatMap {
    fn default() -> Self {
        Self {
            formats: vec![
                Format {
                    payload_type: 96,
                    sample_rate: 44_100,
                    channels: 2,
                    name: "L16/44100/2",
                },
                Format {
                    payload_type: 97,
                    sample_rate: 48_000,
                    channels: 2,
                    name: "L16/48000/2",
                },
            ],
        }
    }
}

impl FormatMap {
    /// Look up a format by payload type.
    #[must_use]
    pub fn find(&self, payload_type: u8) -> Option<&Format> {
        self.formats.iter().find(|f| f.payload_type == payload_type)
    }

    /// Register or replace a format.
    pub fn add(&mut self, format: Format) {
        self.formats.retain(|f| f.payload_type != format.payload_type);
        self.formats.push(format);
    }
}

/// Network-order 16-bit PCM.
struct L16Decoder {
    channels: usize,
}

impl Decoder for L16Decoder {
    fn decode(&mut self, payload: &[u8], out: &mut Vec<Sample>) -> bool {
        if payload.len() % (2 * self.channels) != 0 {
            return false;
        }

        out.reserve(payload.len() / 2);
        for pair in payload.chunks_exact(2) {
            let raw = BigEndian::read_i16(pair);
            out.push(Sample::from(raw) / 32_768.0);
        }

        true
    }
}

/// Encode interleaved samples as network-order 16-bit PCM, appending to
/// `out`. The inverse of the built-in decoder, used by the packetizer.
pub fn encode_l16(samples: &[Sample], out: &mut Vec<u8>) {
    out.reserve(samples.len() * 2);
    for &s in samples {
        let clamped = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
        let mut raw = [0u8; 2];
        BigEndian::write_i16(&mut raw, clamped);
        out.extend_from_slice(&raw);
    }
}
