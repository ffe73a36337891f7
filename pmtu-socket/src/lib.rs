//!
//! # Path MTU Probe Sockets
//!
//! This crate provides the transport of a Path-MTU-Discovery debugging tool: raw IPv4
//! sockets carrying hand-built UDP datagrams with the "don't fragment" bit set, and a
//! demultiplexer that delivers both the UDP replies and any ICMP messages (such as
//! "fragmentation needed") through a single receive call. The client and server probe
//! protocols are built on top of it.
//!

pub mod client;
pub mod create;
pub mod demux;
pub mod header;
pub mod icmp;
pub mod server;
pub mod session;


pub use client::{Client, ClientConfig, ConfigError, Outcome};
pub use create::{CreateError, RawSocket, create_raw_socket, net_raw_capability};
pub use demux::{Event, IcmpEvent, UdpEvent};
pub use header::{
    EncodeError, Ipv4Header, MAX_UDP_PAYLOAD, checksum16, encode_ip_udp_header,
};
pub use icmp::{Diagnostic, interpret, log_icmp_message};
pub use server::{Server, ServerConfig};
pub use session::{RecvError, SendError, Session, SessionError, Transport};
