//! Egress composition: packet fields in, wire datagram out.

use super::{parse::write_payload_id, FecMeta, Protocol, RtpHeader};
use crate::constants::{PAYLOAD_ID_SIZE, RTP_HEADER_SIZE, RTP_VERSION};
use bytes::{Bytes, BytesMut};
use discortp::rtp::{MutableRtpPacket, RtpType};

/// Stateless datagram composer for one outgoing sub-stream.
#[derive(Clone, Copy, Debug)]
pub struct Composer {
    protocol: Protocol,
}

impl Composer {
    /// Build a composer for the given wire layout.
    #[must_use]
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    /// Compose a source datagram: RTP header, optional payload ID, audio.
    ///
    /// `meta` must be present exactly when the protocol is FEC-framed.
    #[must_use]
    pub fn compose_source(&self, header: &RtpHeader, meta: Option<&FecMeta>, audio: &[u8]) -> Bytes {
        let id_len = if self.protocol.is_fec() {
            PAYLOAD_ID_SIZE
        } else {
            0
        };
        let mut buf = BytesMut::zeroed(RTP_HEADER_SIZE + id_len + audio.len());

        {
            let mut rtp = MutableRtpPacket::new(&mut buf[..])
                .expect("FATAL: composed buffer shorter than an RTP header");
            rtp.set_version(RTP_VERSION);
            rtp.set_marker(header.marker as u8);
            rtp.set_payload_type(RtpType::Dynamic(header.payload_type));
            rtp.set_sequence(header.seqnum.into());
            rtp.set_timestamp(header.timestamp.into());
            rtp.set_ssrc(header.source);
        }

        if let Some(meta) = meta {
            write_payload_id(&mut buf[RTP_HEADER_SIZE..RTP_HEADER_SIZE + PAYLOAD_ID_SIZE], meta);
        }
        buf[RTP_HEADER_SIZE + id_len..].copy_from_slice(audio);

        buf.freeze()
    }

    /// Compose a repair datagram: raw symbol plus payload ID, positioned
    /// per scheme (header for Reed-Solomon, footer for LDPC).
    #[must_use]
    pub fn compose_repair(&self, meta: &FecMeta, symbol: &[u8]) -> Bytes {
        let mut buf = BytesMut::zeroed(PAYLOAD_ID_SIZE + symbol.len());

        match self.protocol {
            Protocol::LdpcRepair | Protocol::RtpLdpcSource => {
                buf[..symbol.len()].copy_from_slice(symbol);
                write_payload_id(&mut buf[symbol.len()..], meta);
            },
            _ => {
                write_payload_id(&mut buf[..PAYLOAD_ID_SIZE], meta);
                buf[PAYLOAD_ID_SIZE..].copy_from_slice(symbol);
            },
        }

        buf.freeze()
    }
}
