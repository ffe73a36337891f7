//! # Fragmentation-Needed Fabrication
//!
//! Builds and sends an ICMP "destination unreachable, fragmentation needed" message
//! claiming to come from a router on the path, so one can watch how a host reacts to
//! a lowered path MTU without having such a router at hand.
//!
//! The message quotes the start of a made-up UDP datagram from `dst` back to `src`,
//! which is what a real router would quote if `dst` had sent us an oversized packet.

use std::io;
use std::net::Ipv4Addr;

use pmtu_socket::header::{IPV4_HEADER_LEN, PROTO_ICMP};
use pmtu_socket::{Ipv4Header, checksum16, create_raw_socket, encode_ip_udp_header};

const DUMMY_PORT: u16 = 1337;
const DUMMY_PAYLOAD_LEN: usize = 1472;
/// How much of the offending datagram the message quotes.
const QUOTED_LEN: usize = 556;
const ICMP_HEADER_LEN: usize = 8;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const CODE_FRAGMENTATION_NEEDED: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeedToFrag {
    /// Address the message claims to come from.
    pub src: Ipv4Addr,
    /// Host the message is sent to.
    pub dst: Ipv4Addr,
    /// Next-hop MTU announced in the message.
    pub mtu: u16,
    pub ttl: u8,
}

impl NeedToFrag {
    /// The datagram `dst` supposedly sent towards `src`.
    pub fn dummy_source_packet(&self) -> io::Result<Vec<u8>> {
        let header = encode_ip_udp_header(
            self.dst,
            DUMMY_PORT,
            self.src,
            DUMMY_PORT,
            DUMMY_PAYLOAD_LEN,
        )
        .map_err(io::Error::other)?;
        let mut packet = header.to_vec();
        packet.resize(header.len() + DUMMY_PAYLOAD_LEN, 0);
        Ok(packet)
    }

    /// The full IPv4 packet carrying the ICMP message, ready for an `IPPROTO_RAW` socket.
    pub fn encode_packet(&self) -> io::Result<Vec<u8>> {
        let original = self.dummy_source_packet()?;

        let mut icmp = vec![0u8; ICMP_HEADER_LEN];
        icmp[0] = ICMP_DEST_UNREACHABLE;
        icmp[1] = CODE_FRAGMENTATION_NEEDED;
        icmp[6..8].copy_from_slice(&self.mtu.to_be_bytes());
        icmp.extend_from_slice(&original[..QUOTED_LEN]);
        let checksum = checksum16(&icmp);
        icmp[2..4].copy_from_slice(&checksum.to_be_bytes());

        let ip = Ipv4Header::new(self.src, self.dst, PROTO_ICMP, self.ttl, icmp.len())
            .map_err(io::Error::other)?;
        let mut packet = Vec::with_capacity(IPV4_HEADER_LEN + icmp.len());
        packet.extend_from_slice(&ip.encode());
        packet.extend_from_slice(&icmp);
        Ok(packet)
    }

    /// Sends the message to `dst`.
    ///
    /// # Errors
    ///
    /// Fails if the raw socket cannot be opened (usually missing `CAP_NET_RAW`) or the
    /// kernel refuses the packet.
    pub fn send(&self) -> io::Result<()> {
        let packet = self.encode_packet()?;
        let socket = create_raw_socket(libc::IPPROTO_RAW).map_err(io::Error::other)?;
        let sent = socket.send_to(&packet, self.dst)?;
        if sent != packet.len() {
            return Err(io::Error::other(format!(
                "short send: {sent} of {} bytes",
                packet.len()
            )));
        }
        log::info!(
            "sent fragmentation-needed (mtu={}) from {} to {}",
            self.mtu,
            self.src,
            self.dst
        );
        Ok(())
    }
}
