//! Sender pipeline assembly: packetizer, FEC writer, wire composition.

use crate::{
    audio::{Packetizer, Sample},
    config::SenderConfig,
    constants::{PAYLOAD_ID_SIZE, RTP_HEADER_SIZE, SAMPLE_BYTE_SIZE},
    error::{Error, Result},
    fec::{new_encoder, FecConfig, FecWriter},
    net::Datagram,
    packet::{Composer, Packet, PacketFlags, PacketPtr, PacketWriter, Protocol},
    rtp::FormatMap,
};
use std::net::SocketAddr;

/// Forwards composed packets to the network context as datagrams.
struct NetWriter {
    tx: flume::Sender<Datagram>,
}

impl PacketWriter for NetWriter {
    fn write(&mut self, packet: PacketPtr) {
        let _ = self.tx.send(Datagram {
            repair: packet.has_flags(PacketFlags::REPAIR),
            data: packet.data(),
        });
    }
}

/// Composes plain RTP datagrams when FEC is off.
struct PlainWriter {
    composer: Composer,
    inner: NetWriter,
    addr: SocketAddr,
}

impl PacketWriter for PlainWriter {
    fn write(&mut self, packet: PacketPtr) {
        let rtp = *packet.rtp().expect("packetizer output carries rtp");
        let wire = self.composer.compose_source(&rtp, None, &packet.payload());
        let composed = Packet::new(
            packet.flags().with(PacketFlags::COMPOSED),
            Some(rtp),
            None,
            wire,
            packet.payload(),
            self.addr,
        );
        self.inner.write(composed);
    }
}

/// The outbound half of the transport: samples in, datagrams out.
pub struct Sender {
    packetizer: Packetizer,
    sample_rate: usize,
    channels: usize,
    samples_per_packet: usize,
}

impl Sender {
    /// Build the sender chain. Returns the sender plus the datagram
    /// stream the network context must drain.
    pub fn new(
        config: &SenderConfig,
        formats: &FormatMap,
        source_addr: SocketAddr,
        repair_addr: SocketAddr,
    ) -> Result<(Self, flume::Receiver<Datagram>)> {
        config.check()?;

        let format = formats
            .find(config.payload_type)
            .ok_or(Error::UnknownPayloadType(config.payload_type))?;

        let (tx, rx) = flume::unbounded();
        let net = NetWriter { tx };

        let writer: Box<dyn PacketWriter> = match &config.fec {
            Some(fec) => {
                let payload_size = RTP_HEADER_SIZE
                    + PAYLOAD_ID_SIZE
                    + config.samples_per_packet * format.channels * SAMPLE_BYTE_SIZE;
                let fec_config = FecConfig {
                    scheme: fec.scheme,
                    n_source_packets: fec.n_source_packets,
                    n_repair_packets: fec.n_repair_packets,
                    payload_size,
                    ..FecConfig::default()
                };
                let pool = crate::buffer::Pool::new(
                    payload_size,
                    2 * (fec.n_source_packets + fec.n_repair_packets),
                );
                let encoder = new_encoder(&fec_config, pool)
                    .ok_or(Error::IllegalConfig("cannot build fec encoder"))?;
                Box::new(FecWriter::new(
                    &fec_config,
                    encoder,
                    Box::new(net),
                    source_addr,
                    repair_addr,
                ))
            },
            None => Box::new(PlainWriter {
                composer: Composer::new(Protocol::Rtp),
                inner: net,
                addr: source_addr,
            }),
        };

        let packetizer = Packetizer::new(
            writer,
            config.payload_type,
            format.channels,
            config.samples_per_packet,
            source_addr,
        );

        Ok((
            Self {
                packetizer,
                sample_rate: format.sample_rate,
                channels: format.channels,
                samples_per_packet: config.samples_per_packet,
            },
            rx,
        ))
    }

    /// Stream sample rate, for pacing.
    #[must_use]
    pub fn sample_rate(&self) -> usize {
        self.sample_rate
    }

    /// Interleaved channel count of the stream.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Per-channel samples per packet.
    #[must_use]
    pub fn samples_per_packet(&self) -> usize {
        self.samples_per_packet
    }

    /// Push interleaved samples into the pipeline.
    pub fn write(&mut self, samples: &[Sample]) {
        self.packetizer.write(samples);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FecParams;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn plain_sender_emits_source_datagrams_only() {
        let config = SenderConfig::default();
        let (mut sender, rx) =
            Sender::new(&config, &FormatMap::default(), addr(7000), addr(7001)).unwrap();

        sender.write(&vec![0.0; 320 * 2 * 3]);
        let out: Vec<Datagram> = rx.drain().collect();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|d| !d.repair));
        assert!(out.iter().all(|d| d.data.len() == RTP_HEADER_SIZE + 320 * 2 * 2));
    }

    #[test]
    fn fec_sender_interleaves_repair() {
        let config = SenderConfig::default().fec(Some(FecParams {
            n_source_packets: 4,
            n_repair_packets: 2,
            ..FecParams::default()
        }));
        let (mut sender, rx) =
            Sender::new(&config, &FormatMap::default(), addr(7000), addr(7001)).unwrap();

        sender.write(&vec![0.0; 320 * 2 * 4]);
        let out: Vec<Datagram> = rx.drain().collect();
        assert_eq!(out.len(), 6);
        assert!(out[..4].iter().all(|d| !d.repair));
        assert!(out[4..].iter().all(|d| d.repair));
    }

    #[test]
    fn unknown_payload_type_is_rejected() {
        let config = SenderConfig::default().payload_type(42);
        assert!(Sender::new(&config, &FormatMap::default(), addr(7000), addr(7001)).is_err());
    }
}
