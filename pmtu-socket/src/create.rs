//! # Raw IPv4 Socket Creation and Configuration
//!
//! ## Purpose
//!
//! This file opens the raw IPv4 sockets the probe runs on. Every socket is created in
//! "header included" mode, so the caller writes the IPv4 header itself, and in
//! path-MTU "probe" mode, so the kernel neither fragments our datagrams nor shrinks
//! them after it has seen a fragmentation-needed message.
//!
//! ## How it works
//!
//! It uses `libc` syscalls to create an `AF_INET`/`SOCK_RAW` socket for the requested
//! protocol, non-blocking so it can be driven by tokio's `AsyncFd`. It then sets
//! `IP_HDRINCL` and `IP_MTU_DISCOVER = IP_PMTUDISC_PROBE`. Permission failures are
//! reported together with the state of `CAP_NET_RAW` in the effective capability set.
//!
//! ## Main components
//!
//! - `create_raw_socket()`: opens and configures the socket.
//! - `RawSocket`: owned descriptor with `recv` and `send_to`.
//! - `net_raw_capability()`: queries `CAP_NET_RAW` for diagnostics.

use std::io;
use std::mem::size_of;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd as _, OwnedFd, RawFd};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CreateError {
    #[error(
        "permission denied opening raw socket for protocol {protocol} (CAP_NET_RAW {capability}); \
         run as root or grant CAP_NET_RAW"
    )]
    PermissionDenied {
        protocol: libc::c_int,
        capability: &'static str,
    },
    #[error("failed to create raw socket for protocol {protocol}: {source}")]
    Socket {
        protocol: libc::c_int,
        source: io::Error,
    },
    #[error("failed to set {option} on raw socket: {source}")]
    SetOption {
        option: &'static str,
        source: io::Error,
    },
}

/// An owned raw IPv4 socket, closed on drop.
#[derive(Debug)]
pub struct RawSocket {
    fd: OwnedFd,
    protocol: libc::c_int,
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl RawSocket {
    pub fn protocol(&self) -> libc::c_int {
        self.protocol
    }

    /// Reads one packet, IPv4 header included.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Transmits a complete IPv4 packet (header included) to `dst`.
    pub fn send_to(&self, packet: &[u8], dst: Ipv4Addr) -> io::Result<usize> {
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from(dst).to_be(),
            },
            sin_zero: [0; 8],
        };
        let n = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                packet.as_ptr().cast(),
                packet.len(),
                0,
                &addr as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Creates a raw IPv4 socket for `protocol` (`IPPROTO_UDP`, `IPPROTO_ICMP`, `IPPROTO_RAW`).
///
/// # How it works
///
/// 1.  Creates a non-blocking, close-on-exec `SOCK_RAW` socket.
/// 2.  Enables `IP_HDRINCL`: outgoing packets carry a caller-built IPv4 header.
/// 3.  Sets `IP_MTU_DISCOVER` to `IP_PMTUDISC_PROBE`: the kernel never fragments and
///     ignores any path MTU it has cached for the destination.
///
/// # Returns
/// The configured socket, or `CreateError::PermissionDenied` if the process lacks
/// the privilege to open raw sockets.
pub fn create_raw_socket(protocol: libc::c_int) -> Result<RawSocket, CreateError> {
    let fd = unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            protocol,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EPERM | libc::EACCES) => CreateError::PermissionDenied {
                    protocol,
                    capability: match net_raw_capability() {
                        Some(true) => "present",
                        Some(false) => "missing",
                        None => "unknown",
                    },
                },
                _ => CreateError::Socket {
                    protocol,
                    source: err,
                },
            });
        }
        OwnedFd::from_raw_fd(fd)
    };

    set_ip_option(fd.as_raw_fd(), libc::IP_HDRINCL, 1).map_err(|source| {
        CreateError::SetOption {
            option: "IP_HDRINCL",
            source,
        }
    })?;

    // Lets us keep sending at the probe size after a "packet too big" has come in.
    set_ip_option(
        fd.as_raw_fd(),
        libc::IP_MTU_DISCOVER,
        libc::IP_PMTUDISC_PROBE,
    )
    .map_err(|source| CreateError::SetOption {
        option: "IP_MTU_DISCOVER",
        source,
    })?;

    log::debug!("raw socket (fd {}) opened for protocol {protocol}", fd.as_raw_fd());
    Ok(RawSocket { fd, protocol })
}

fn set_ip_option(raw_fd: RawFd, option: libc::c_int, value: libc::c_int) -> io::Result<()> {
    if unsafe {
        libc::setsockopt(
            raw_fd,
            libc::IPPROTO_IP,
            option,
            &value as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
    } {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Whether `CAP_NET_RAW` is in the effective set of this process, if that can be read.
pub fn net_raw_capability() -> Option<bool> {
    caps::has_cap(None, caps::CapSet::Effective, caps::Capability::CAP_NET_RAW).ok()
}
