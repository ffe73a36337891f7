//
// demux.rs - Inbound Packet Classification for a Session
//
// Purpose:
//   A raw IPv4 socket sees every packet of its protocol that reaches the host. This module
//   runs the two reader loops of a session (one per raw socket), decides which packets
//   belong to the session and hands those over to the session's single-slot queues.
//
// How it works:
//   - Each loop waits for its socket to become readable via tokio's AsyncFd, reads one
//     packet and classifies it with a pure function (`classify_udp` / `classify_icmp`).
//   - Packets that fail classification are dropped; malformed ones are logged with a
//     warning, foreign ones only at trace level.
//   - Accepted packets are sent to a capacity-one channel. Both the read and the hand-off
//     race against the session's shutdown token, so a loop exits promptly on close even
//     when nobody drains the queue.
//
// Main components:
//   - UdpEvent, IcmpEvent, Event: what a session delivers to its consumer.
//   - Filter: the session identity packets are matched against.
//   - classify_udp(), classify_icmp(): per-packet filtering rules.
//   - udp_reader(), icmp_reader(): the reader loops spawned by the session.
//

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::create::RawSocket;
use crate::header::{
    DecodeError, PROTO_ICMP, PROTO_UDP, UDP_HEADER_LEN, decode_ip_header, decode_udp_header,
};

/// Large enough for any IPv4 packet.
const RECV_BUFFER_SIZE: usize = 0x10000;

/// A UDP payload addressed to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpEvent {
    pub payload: Vec<u8>,
    pub source: SocketAddrV4,
}

/// An ICMP message addressed to the session's host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpEvent {
    /// The ICMP message, starting at its type byte.
    pub payload: Vec<u8>,
    pub source: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Udp(UdpEvent),
    Icmp(IcmpEvent),
}

/// Identity of a session as seen by its reader loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub local: SocketAddrV4,
    /// Set for connected (client) sessions only.
    pub remote: Option<SocketAddrV4>,
}

/// Why a packet was not delivered.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    #[error("invalid header: {0}")]
    Malformed(#[from] DecodeError),
    #[error("protocol {0} does not match")]
    Protocol(u8),
    #[error("destination {0} is not ours")]
    Destination(Ipv4Addr),
    #[error("destination port {0} is not ours")]
    Port(u16),
    #[error("source {0} is not the connected peer")]
    Source(SocketAddrV4),
    #[error("length overflow from {sender}: declared {declared} bytes, {available} captured")]
    Length {
        sender: Ipv4Addr,
        declared: usize,
        available: usize,
    },
}

impl Discard {
    fn log(&self, kind: &str) {
        match self {
            Discard::Malformed(_) | Discard::Length { .. } => {
                log::warn!("dropping {kind} packet: {self}")
            }
            _ => log::trace!("dropping {kind} packet: {self}"),
        }
    }
}

/// Applies the session's UDP rules to one raw packet.
///
/// Connected sessions only accept datagrams sent to their local address from the exact
/// remote endpoint; unconnected ones accept any source. The UDP length field is checked
/// against the captured bytes before the payload is sliced out.
pub fn classify_udp(packet: &[u8], filter: &Filter) -> Result<UdpEvent, Discard> {
    let ip = decode_ip_header(packet)?;
    if ip.protocol != PROTO_UDP {
        return Err(Discard::Protocol(ip.protocol));
    }
    if filter.remote.is_some() && ip.dst != *filter.local.ip() {
        return Err(Discard::Destination(ip.dst));
    }
    let udp = decode_udp_header(&packet[ip.header_len..])?;
    if udp.dst_port != filter.local.port() {
        return Err(Discard::Port(udp.dst_port));
    }
    let source = SocketAddrV4::new(ip.src, udp.src_port);
    if let Some(remote) = filter.remote {
        if source != remote {
            return Err(Discard::Source(source));
        }
    }
    let declared = usize::from(udp.length);
    let available = packet.len() - ip.header_len;
    if declared < UDP_HEADER_LEN || declared > available {
        return Err(Discard::Length {
            sender: ip.src,
            declared,
            available,
        });
    }
    let body = ip.header_len + UDP_HEADER_LEN;
    Ok(UdpEvent {
        payload: packet[body..ip.header_len + declared].to_vec(),
        source,
    })
}

/// Applies the session's ICMP rules to one raw packet.
///
/// An unspecified local address (unconnected sessions) accepts ICMP for any of the
/// host's addresses.
pub fn classify_icmp(packet: &[u8], filter: &Filter) -> Result<IcmpEvent, Discard> {
    let ip = decode_ip_header(packet)?;
    if ip.protocol != PROTO_ICMP {
        return Err(Discard::Protocol(ip.protocol));
    }
    let local = filter.local.ip();
    if !local.is_unspecified() && ip.dst != *local {
        return Err(Discard::Destination(ip.dst));
    }
    let end = usize::from(ip.total_len);
    if end > packet.len() {
        return Err(Discard::Length {
            sender: ip.src,
            declared: end,
            available: packet.len(),
        });
    }
    Ok(IcmpEvent {
        payload: packet[ip.header_len..end].to_vec(),
        source: ip.src,
    })
}

pub(crate) async fn udp_reader(
    socket: Arc<AsyncFd<RawSocket>>,
    filter: Filter,
    queue: mpsc::Sender<UdpEvent>,
    shutdown: CancellationToken,
) {
    read_loop("UDP", &socket, &queue, &shutdown, |packet| {
        classify_udp(packet, &filter)
    })
    .await
}

pub(crate) async fn icmp_reader(
    socket: Arc<AsyncFd<RawSocket>>,
    filter: Filter,
    queue: mpsc::Sender<IcmpEvent>,
    shutdown: CancellationToken,
) {
    read_loop("ICMP", &socket, &queue, &shutdown, |packet| {
        classify_icmp(packet, &filter)
    })
    .await
}

async fn read_loop<T, F>(
    kind: &str,
    socket: &AsyncFd<RawSocket>,
    queue: &mpsc::Sender<T>,
    shutdown: &CancellationToken,
    classify: F,
) where
    F: Fn(&[u8]) -> Result<T, Discard>,
{
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = recv(socket, &mut buf) => match res {
                Ok(n) => n,
                Err(e) => {
                    // errors after close are expected
                    if !shutdown.is_cancelled() {
                        log::error!(
                            "reading raw {kind} socket (protocol {}) failed: {e}",
                            socket.get_ref().protocol()
                        );
                    }
                    return;
                }
            },
        };

        let item = match classify(&buf[..n]) {
            Ok(item) => item,
            Err(discard) => {
                discard.log(kind);
                continue;
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,
            res = queue.send(item) => if res.is_err() {
                return;
            },
        }
    }
}

async fn recv(socket: &AsyncFd<RawSocket>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = socket.readable().await?;
        match guard.try_io(|inner| inner.get_ref().recv(&mut buf[..])) {
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}
