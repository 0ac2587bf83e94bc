//! UDP runners bridging sockets and the pipeline channels.
//!
//! The network context never pulls frames and never blocks on the
//! pipeline: ingress parses and forwards over a channel, egress drains a
//! channel into `send_to`.

use crate::{
    constants::MAX_PACKET_SIZE,
    packet::Parser,
    receiver::ReceiverHandle,
};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// One composed datagram headed for the wire.
#[derive(Clone, Debug)]
pub struct Datagram {
    /// Selects the repair destination over the source destination.
    pub repair: bool,
    /// Complete wire image.
    pub data: Bytes,
}

/// Receive loop for one bound port: datagram, parse, hand off.
///
/// Runs until the socket errors out; parse failures only cost the one
/// packet.
pub async fn receive_loop(socket: UdpSocket, parser: Parser, handle: ReceiverHandle) {
    trace!("udp receive loop started");

    loop {
        let mut buf = BytesMut::zeroed(MAX_PACKET_SIZE);

        match socket.recv_from(&mut buf).await {
            Ok((len, addr)) => {
                buf.truncate(len);
                match parser.parse(buf.freeze(), addr) {
                    Some(packet) => handle.write(packet),
                    None => trace!("unparseable datagram from {addr}"),
                }
            },
            Err(e) => {
                error!("udp receive failure: {e}");
                break;
            },
        }
    }

    trace!("udp receive loop stopped");
}

/// Transmit loop: drain composed datagrams towards their destinations.
///
/// Runs until the sender side of the channel is dropped or the socket
/// errors out.
pub async fn send_loop(
    rx: flume::Receiver<Datagram>,
    socket: UdpSocket,
    source_dest: SocketAddr,
    repair_dest: SocketAddr,
) {
    trace!("udp send loop started");

    while let Ok(datagram) = rx.recv_async().await {
        let dest = if datagram.repair {
            repair_dest
        } else {
            source_dest
        };
        if let Err(e) = socket.send_to(&datagram.data, dest).await {
            error!("udp send failure: {e}");
            break;
        }
    }

    trace!("udp send loop stopped");
}
