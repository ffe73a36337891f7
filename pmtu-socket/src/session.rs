//
// session.rs - Raw Socket Session
//
// Purpose:
//   A session is one endpoint of a probe exchange. It sends hand-built IPv4/UDP datagrams
//   and receives, through a single call, either UDP payloads addressed to it or ICMP
//   messages addressed to its host.
//
// How it works:
//   - An ordinary UDP socket reserves the local port and tells us the local address the
//     kernel routes from. No data flows over it; it also keeps the kernel from answering
//     our peer with "port unreachable".
//   - Two raw sockets (UDP and ICMP protocol) are registered with tokio's AsyncFd and read
//     by the reader tasks in `demux`, which feed two capacity-one channels.
//   - `receive` waits on both channels and a timer at once.
//   - `close` fires the shutdown token, joins both reader tasks, and only then releases
//     the sockets, so no task ever reads from a closed descriptor.
//
// Main components:
//   - Session: the transport itself, created by `connect` (client) or `bind` (server).
//   - Transport: the send/receive seam the client and server protocols are written against.
//   - SessionError, SendError, RecvError.
//

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::create::{CreateError, RawSocket, create_raw_socket};
use crate::demux::{self, Event, Filter, IcmpEvent, UdpEvent};
use crate::header::{EncodeError, encode_ip_udp_header};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Create(#[from] CreateError),
    #[error("failed to reserve local UDP port: {0}")]
    Reserve(#[source] io::Error),
    #[error("local address {0} is not IPv4")]
    NotIpv4(SocketAddr),
    #[error("failed to register raw socket with the runtime: {0}")]
    Register(#[source] io::Error),
    #[error("already closed")]
    AlreadyClosed,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    PayloadTooLarge(#[from] EncodeError),
    #[error("no destination given and the session is not connected")]
    NoDestination,
    #[error("session is closed")]
    Closed,
    #[error("failed to send UDP packet: {0}")]
    Io(#[source] io::Error),
    #[error("attempted to write {expected} bytes but wrote {sent}")]
    Short { sent: usize, expected: usize },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    #[error("read operation timed out")]
    Timeout,
    #[error("session is closed")]
    Closed,
    /// A reader task stopped on its own; nothing more will arrive.
    #[error("session reader stopped unexpectedly")]
    ReaderFailed,
}

/// Sending and receiving probe datagrams. Implemented by `Session`; the client and
/// server protocols only depend on this.
pub trait Transport {
    /// Sends `payload` to `dst`, or to the connected peer when `dst` is `None`.
    fn send(
        &mut self,
        payload: &[u8],
        dst: Option<SocketAddrV4>,
    ) -> impl Future<Output = Result<(), SendError>>;

    /// Waits up to `timeout` for the next UDP or ICMP event.
    fn receive(&mut self, timeout: Duration) -> impl Future<Output = Result<Event, RecvError>>;
}

struct Sockets {
    raw_udp: Arc<AsyncFd<RawSocket>>,
    _raw_icmp: Arc<AsyncFd<RawSocket>>,
    _reservation: UdpSocket,
}

/// A raw-socket transport with a UDP and an ICMP reader running in the background.
///
/// Must be created from within a tokio runtime.
pub struct Session {
    local: SocketAddrV4,
    remote: Option<SocketAddrV4>,
    sockets: Option<Sockets>,
    udp_events: mpsc::Receiver<UdpEvent>,
    icmp_events: mpsc::Receiver<IcmpEvent>,
    shutdown: CancellationToken,
    readers: Vec<JoinHandle<()>>,
}

impl Session {
    /// Opens a client session talking to `remote` only.
    pub fn connect(remote: SocketAddrV4) -> Result<Self, SessionError> {
        let reservation = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
            .map_err(SessionError::Reserve)?;
        reservation.connect(remote).map_err(SessionError::Reserve)?;
        Self::open(reservation, Some(remote))
    }

    /// Opens a server session on `port` of every local address, accepting any peer.
    pub fn bind(port: u16) -> Result<Self, SessionError> {
        let reservation = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .map_err(SessionError::Reserve)?;
        Self::open(reservation, None)
    }

    fn open(reservation: UdpSocket, remote: Option<SocketAddrV4>) -> Result<Self, SessionError> {
        let local = match reservation.local_addr().map_err(SessionError::Reserve)? {
            SocketAddr::V4(addr) => addr,
            addr => return Err(SessionError::NotIpv4(addr)),
        };

        let raw_udp = Arc::new(
            AsyncFd::new(create_raw_socket(libc::IPPROTO_UDP)?).map_err(SessionError::Register)?,
        );
        let raw_icmp = Arc::new(
            AsyncFd::new(create_raw_socket(libc::IPPROTO_ICMP)?)
                .map_err(SessionError::Register)?,
        );

        let shutdown = CancellationToken::new();
        let (udp_tx, udp_events) = mpsc::channel(1);
        let (icmp_tx, icmp_events) = mpsc::channel(1);
        let filter = Filter { local, remote };
        let readers = vec![
            tokio::spawn(demux::udp_reader(
                raw_udp.clone(),
                filter,
                udp_tx,
                shutdown.clone(),
            )),
            tokio::spawn(demux::icmp_reader(
                raw_icmp.clone(),
                filter,
                icmp_tx,
                shutdown.clone(),
            )),
        ];

        match remote {
            Some(remote) => log::debug!("session {local} => {remote} opened"),
            None => log::debug!("session on {local} opened"),
        }

        Ok(Self {
            local,
            remote,
            sockets: Some(Sockets {
                raw_udp,
                _raw_icmp: raw_icmp,
                _reservation: reservation,
            }),
            udp_events,
            icmp_events,
            shutdown,
            readers,
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn remote_addr(&self) -> Option<SocketAddrV4> {
        self.remote
    }

    /// Sends `payload` in a single datagram with a hand-built IPv4/UDP header.
    ///
    /// # Arguments
    /// * `payload` - Datagram payload, at most `MAX_UDP_PAYLOAD` bytes.
    /// * `dst` - Destination; `None` sends to the connected peer.
    ///
    /// # Errors
    ///
    /// `SendError::NoDestination` for `None` on an unconnected session,
    /// `SendError::PayloadTooLarge` if the datagram does not fit in an IPv4 packet,
    /// `SendError::Io` if the kernel refuses it (e.g. `EMSGSIZE` above the link MTU).
    pub async fn send(
        &mut self,
        payload: &[u8],
        dst: Option<SocketAddrV4>,
    ) -> Result<(), SendError> {
        let dst = dst.or(self.remote).ok_or(SendError::NoDestination)?;
        let header = encode_ip_udp_header(
            *self.local.ip(),
            self.local.port(),
            *dst.ip(),
            dst.port(),
            payload.len(),
        )?;
        let sockets = self.sockets.as_ref().ok_or(SendError::Closed)?;

        let mut packet = Vec::with_capacity(header.len() + payload.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(payload);

        let sent = loop {
            let mut guard = sockets.raw_udp.writable().await.map_err(SendError::Io)?;
            match guard.try_io(|inner| inner.get_ref().send_to(&packet, *dst.ip())) {
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(result) => break result.map_err(SendError::Io)?,
                Err(_would_block) => continue,
            }
        };
        if sent < packet.len() {
            return Err(SendError::Short {
                sent,
                expected: packet.len(),
            });
        }
        Ok(())
    }

    /// Waits for the next event from either reader, or for `timeout` to pass.
    ///
    /// A timeout leaves the session usable. `RecvError::ReaderFailed` means a reader
    /// task has exited while the session was open.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Event, RecvError> {
        if self.sockets.is_none() {
            return Err(RecvError::Closed);
        }
        next_event(&mut self.udp_events, &mut self.icmp_events, timeout).await
    }

    /// Stops both readers and releases the sockets. A second call fails with
    /// `SessionError::AlreadyClosed`.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        let Some(sockets) = self.sockets.take() else {
            return Err(SessionError::AlreadyClosed);
        };
        self.shutdown.cancel();
        for reader in self.readers.drain(..) {
            if let Err(e) = reader.await {
                log::warn!("reader task of session {} failed: {e}", self.local);
            }
        }
        drop(sockets);
        self.udp_events.close();
        self.icmp_events.close();
        log::debug!("session on {} closed", self.local);
        Ok(())
    }
}

/// Takes whichever queue delivers first. A queue whose sender is gone means its reader
/// exited before `close`.
async fn next_event(
    udp_events: &mut mpsc::Receiver<UdpEvent>,
    icmp_events: &mut mpsc::Receiver<IcmpEvent>,
    timeout: Duration,
) -> Result<Event, RecvError> {
    tokio::select! {
        event = udp_events.recv() => event.map(Event::Udp).ok_or(RecvError::ReaderFailed),
        event = icmp_events.recv() => event.map(Event::Icmp).ok_or(RecvError::ReaderFailed),
        _ = tokio::time::sleep(timeout) => Err(RecvError::Timeout),
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Transport for Session {
    fn send(
        &mut self,
        payload: &[u8],
        dst: Option<SocketAddrV4>,
    ) -> impl Future<Output = Result<(), SendError>> {
        Session::send(self, payload, dst)
    }

    fn receive(&mut self, timeout: Duration) -> impl Future<Output = Result<Event, RecvError>> {
        Session::receive(self, timeout)
    }
}

//
// ================================================================================================
//   UNITTESTS
// ================================================================================================
//
#[cfg(test)]
mod tests {
    use super::*;

    const PEER: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 1337);

    #[tokio::test(start_paused = true)]
    async fn test_next_event_delivers_and_times_out() {
        let (udp_tx, mut udp_rx) = mpsc::channel(1);
        let (_icmp_tx, mut icmp_rx) = mpsc::channel::<IcmpEvent>(1);

        let event = UdpEvent {
            payload: vec![0, 4, 1, 2],
            source: PEER,
        };
        udp_tx.send(event.clone()).await.unwrap();
        assert_eq!(
            next_event(&mut udp_rx, &mut icmp_rx, Duration::from_secs(1)).await,
            Ok(Event::Udp(event))
        );

        // both readers alive but quiet
        assert_eq!(
            next_event(&mut udp_rx, &mut icmp_rx, Duration::from_secs(1)).await,
            Err(RecvError::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_event_reports_dead_reader() {
        let (udp_tx, mut udp_rx) = mpsc::channel::<UdpEvent>(1);
        let (icmp_tx, mut icmp_rx) = mpsc::channel::<IcmpEvent>(1);

        drop(udp_tx);
        assert_eq!(
            next_event(&mut udp_rx, &mut icmp_rx, Duration::from_secs(60)).await,
            Err(RecvError::ReaderFailed)
        );

        drop(icmp_tx);
        for _ in 0..3 {
            assert_eq!(
                next_event(&mut udp_rx, &mut icmp_rx, Duration::from_secs(60)).await,
                Err(RecvError::ReaderFailed)
            );
        }
    }
}
