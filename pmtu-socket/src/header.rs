//! # IPv4 / UDP Header Construction and Parsing
//!
//! ## Purpose
//!
//! Raw sockets opened with `IP_HDRINCL` expect the caller to supply the whole IPv4
//! header, and hand back inbound packets with their IPv4 header still attached. This
//! module builds the 20-byte IPv4 header and the 8-byte UDP header for outgoing
//! datagrams and parses both headers out of inbound packets.
//!
//! ## How it works
//!
//! Headers are written by hand into fixed-size arrays, network byte order throughout.
//! Every IPv4 header leaves with the "don't fragment" bit set and its checksum
//! computed over the header with a zeroed checksum field, then patched in. The UDP
//! checksum is left at zero (unused), which IPv4 permits.
//!
//! Decoding never trusts a length field beyond the captured bytes: `decode_ip_header`
//! guarantees that `header_len` bytes are present, everything past that is the
//! caller's business.
//!
//! ## Main components
//!
//! - `encode_ip_udp_header()`: the 28-byte IPv4 + UDP prefix for a datagram.
//! - `Ipv4Header::encode()`: general IPv4 header encoder (any protocol and TTL).
//! - `checksum16()`: the Internet checksum.
//! - `decode_ip_header()`, `decode_udp_header()`: inbound header parsing.

use std::net::Ipv4Addr;

use static_assertions::const_assert_eq;
use thiserror::Error;

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const IP_UDP_HEADER_LEN: usize = IPV4_HEADER_LEN + UDP_HEADER_LEN;

/// Largest payload that still fits the 16-bit IPv4 total length field.
pub const MAX_UDP_PAYLOAD: usize = 0xffff - IP_UDP_HEADER_LEN;
const_assert_eq!(MAX_UDP_PAYLOAD, 65507);

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_UDP: u8 = 17;

/// TTL of every probe datagram.
pub const PROBE_TTL: u8 = 32;

const FLAG_DONT_FRAGMENT: u16 = 0x4000;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("cannot encode packet this large: payload of {len} bytes exceeds {max}")]
    PayloadTooLarge { len: usize, max: usize },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("header truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("unsupported IP version {0}")]
    BadVersion(u8),
    #[error("invalid IPv4 header length {0}")]
    BadHeaderLength(usize),
    #[error("total length {total_len} is shorter than the header ({header_len} bytes)")]
    BadTotalLength { total_len: u16, header_len: usize },
}

/// An IPv4 header without options on the way out; options are skipped on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes (IHL × 4).
    pub header_len: usize,
    pub total_len: u16,
    pub id: u16,
    pub dont_fragment: bool,
    pub ttl: u8,
    pub protocol: u8,
    /// Checksum as found on the wire. Ignored by `encode`, which computes its own.
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Creates a header for `payload_len` bytes following it, with a random
    /// identification value and the "don't fragment" flag set.
    pub fn new(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        ttl: u8,
        payload_len: usize,
    ) -> Result<Self, EncodeError> {
        let max = 0xffff - IPV4_HEADER_LEN;
        if payload_len > max {
            return Err(EncodeError::PayloadTooLarge { len: payload_len, max });
        }
        Ok(Self {
            header_len: IPV4_HEADER_LEN,
            total_len: (IPV4_HEADER_LEN + payload_len) as u16,
            id: rand::random(),
            dont_fragment: true,
            ttl,
            protocol,
            checksum: 0,
            src,
            dst,
        })
    }

    /// Serializes the header (no options) with the checksum filled in.
    pub fn encode(&self) -> [u8; IPV4_HEADER_LEN] {
        let mut hdr = [0u8; IPV4_HEADER_LEN];
        hdr[0] = 0x45; // version 4, 5 words
        hdr[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        hdr[4..6].copy_from_slice(&self.id.to_be_bytes());
        let flags = if self.dont_fragment { FLAG_DONT_FRAGMENT } else { 0 };
        hdr[6..8].copy_from_slice(&flags.to_be_bytes());
        hdr[8] = self.ttl;
        hdr[9] = self.protocol;
        hdr[12..16].copy_from_slice(&self.src.octets());
        hdr[16..20].copy_from_slice(&self.dst.octets());
        let checksum = checksum16(&hdr);
        hdr[10..12].copy_from_slice(&checksum.to_be_bytes());
        hdr
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Length of the UDP header plus payload.
    pub length: u16,
}

impl UdpHeader {
    pub fn encode(&self) -> [u8; UDP_HEADER_LEN] {
        let mut hdr = [0u8; UDP_HEADER_LEN];
        hdr[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        hdr[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        hdr[4..6].copy_from_slice(&self.length.to_be_bytes());
        // bytes 6..8: checksum, unused
        hdr
    }
}

/// Constructs the IPv4 and UDP headers for a datagram carrying `payload_len` bytes.
///
/// # Arguments
/// * `local_addr`, `local_port` - Source of the datagram.
/// * `remote_addr`, `remote_port` - Destination of the datagram.
/// * `payload_len` - Number of payload bytes that will follow the headers.
///
/// # Returns
/// The 28 header bytes, or `EncodeError::PayloadTooLarge` if the datagram would
/// not fit the IPv4 total length field.
pub fn encode_ip_udp_header(
    local_addr: Ipv4Addr,
    local_port: u16,
    remote_addr: Ipv4Addr,
    remote_port: u16,
    payload_len: usize,
) -> Result<[u8; IP_UDP_HEADER_LEN], EncodeError> {
    if payload_len > MAX_UDP_PAYLOAD {
        return Err(EncodeError::PayloadTooLarge {
            len: payload_len,
            max: MAX_UDP_PAYLOAD,
        });
    }
    let ip = Ipv4Header::new(
        local_addr,
        remote_addr,
        PROTO_UDP,
        PROBE_TTL,
        UDP_HEADER_LEN + payload_len,
    )?;
    let udp = UdpHeader {
        src_port: local_port,
        dst_port: remote_port,
        length: (UDP_HEADER_LEN + payload_len) as u16,
    };

    let mut hdr = [0u8; IP_UDP_HEADER_LEN];
    hdr[..IPV4_HEADER_LEN].copy_from_slice(&ip.encode());
    hdr[IPV4_HEADER_LEN..].copy_from_slice(&udp.encode());
    Ok(hdr)
}

/// The Internet checksum (RFC 1071) over `data`.
///
/// Sums big-endian 16-bit words, padding an odd trailing byte with zero, folds the
/// carries back into the low 16 bits and returns the one's complement. Summing a
/// header that already carries its checksum yields zero.
pub fn checksum16(data: &[u8]) -> u16 {
    let mut sum: u64 = 0;
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        sum += u64::from(*last) << 8;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Parses the IPv4 header at the start of `bytes`.
///
/// The returned `header_len` is always backed by `bytes`; `total_len` is only
/// checked against the header length, since ICMP errors quote truncated packets.
pub fn decode_ip_header(bytes: &[u8]) -> Result<Ipv4Header, DecodeError> {
    if bytes.len() < IPV4_HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: IPV4_HEADER_LEN,
            got: bytes.len(),
        });
    }
    let version = bytes[0] >> 4;
    if version != 4 {
        return Err(DecodeError::BadVersion(version));
    }
    let header_len = usize::from(bytes[0] & 0x0f) * 4;
    if header_len < IPV4_HEADER_LEN {
        return Err(DecodeError::BadHeaderLength(header_len));
    }
    if bytes.len() < header_len {
        return Err(DecodeError::Truncated {
            needed: header_len,
            got: bytes.len(),
        });
    }
    let total_len = u16::from_be_bytes([bytes[2], bytes[3]]);
    if usize::from(total_len) < header_len {
        return Err(DecodeError::BadTotalLength {
            total_len,
            header_len,
        });
    }
    let flags = u16::from_be_bytes([bytes[6], bytes[7]]);

    Ok(Ipv4Header {
        header_len,
        total_len,
        id: u16::from_be_bytes([bytes[4], bytes[5]]),
        dont_fragment: flags & FLAG_DONT_FRAGMENT != 0,
        ttl: bytes[8],
        protocol: bytes[9],
        checksum: u16::from_be_bytes([bytes[10], bytes[11]]),
        src: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
        dst: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
    })
}

/// Parses the UDP header from the bytes that follow the IPv4 header.
pub fn decode_udp_header(bytes: &[u8]) -> Result<UdpHeader, DecodeError> {
    if bytes.len() < UDP_HEADER_LEN {
        return Err(DecodeError::Truncated {
            needed: UDP_HEADER_LEN,
            got: bytes.len(),
        });
    }
    Ok(UdpHeader {
        src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
        dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
        length: u16::from_be_bytes([bytes[4], bytes[5]]),
    })
}

//
// ================================================================================================
//   UNITTESTS
// ================================================================================================
//
#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::{SlicedPacket, TransportSlice};

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 77, 100);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 168, 77, 101);

    #[test]
    fn test_checksum_known_header() {
        // 192.168.0.1 -> 192.168.0.199, checksum 0xb861
        let mut hdr = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0xb8, 0x61, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(checksum16(&hdr), 0);
        hdr[10] = 0;
        hdr[11] = 0;
        assert_eq!(checksum16(&hdr), 0xb861);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum16(&[0x01]), !0x0100);
        assert_eq!(checksum16(&[0x12, 0x34, 0x56]), !(0x1234u16 + 0x5600));
        assert_eq!(checksum16(&[]), 0xffff);
    }

    #[test]
    fn test_checksum_folds_carries() {
        assert_eq!(checksum16(&[0xff, 0xff, 0x00, 0x01]), !0x0001);
    }

    #[test]
    fn test_encoded_header_sums_to_zero() {
        for payload_len in [0, 1, 1472, MAX_UDP_PAYLOAD] {
            let hdr = encode_ip_udp_header(SRC, 1337, DST, 9000, payload_len).unwrap();
            assert_eq!(checksum16(&hdr[..IPV4_HEADER_LEN]), 0);
        }
    }

    #[test]
    fn test_encode_ip_udp_header_fields() {
        let hdr = encode_ip_udp_header(SRC, 1337, DST, 9000, 1472).unwrap();
        let ip = decode_ip_header(&hdr).unwrap();
        assert_eq!(ip.header_len, 20);
        assert_eq!(ip.total_len, 1500);
        assert!(ip.dont_fragment);
        assert_eq!(ip.ttl, PROBE_TTL);
        assert_eq!(ip.protocol, PROTO_UDP);
        assert_eq!(ip.src, SRC);
        assert_eq!(ip.dst, DST);

        let udp = decode_udp_header(&hdr[ip.header_len..]).unwrap();
        assert_eq!(udp.src_port, 1337);
        assert_eq!(udp.dst_port, 9000);
        assert_eq!(udp.length, 1480);
        assert_eq!(&hdr[26..28], &[0, 0]);
    }

    #[test]
    fn test_encode_payload_bounds() {
        let hdr = encode_ip_udp_header(SRC, 1, DST, 2, 0).unwrap();
        assert_eq!(decode_ip_header(&hdr).unwrap().total_len, 28);
        let hdr = encode_ip_udp_header(SRC, 1, DST, 2, MAX_UDP_PAYLOAD).unwrap();
        assert_eq!(decode_ip_header(&hdr).unwrap().total_len, 0xffff);
        assert_eq!(
            encode_ip_udp_header(SRC, 1, DST, 2, MAX_UDP_PAYLOAD + 1),
            Err(EncodeError::PayloadTooLarge {
                len: MAX_UDP_PAYLOAD + 1,
                max: MAX_UDP_PAYLOAD
            })
        );
    }

    #[test]
    fn test_encoded_packet_parses_as_udp() {
        let data = b"Hello, PMTU!";
        let hdr = encode_ip_udp_header(SRC, 12345, DST, 54321, data.len()).unwrap();
        let mut buf = hdr.to_vec();
        buf.extend_from_slice(data);
        match SlicedPacket::from_ip(&buf) {
            Ok(packet) => match packet.transport {
                Some(TransportSlice::Udp(udp)) => {
                    assert_eq!(udp.source_port(), 12345);
                    assert_eq!(udp.destination_port(), 54321);
                    assert_eq!(usize::from(udp.length()), UDP_HEADER_LEN + data.len());
                }
                _ => panic!("Not udp packet"),
            },
            Err(e) => panic!("Failed to parse packet: {}", e),
        };
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let good = encode_ip_udp_header(SRC, 1, DST, 2, 0).unwrap();

        assert_eq!(
            decode_ip_header(&good[..19]),
            Err(DecodeError::Truncated { needed: 20, got: 19 })
        );

        let mut v6 = good;
        v6[0] = 0x65;
        assert_eq!(decode_ip_header(&v6), Err(DecodeError::BadVersion(6)));

        let mut short_ihl = good;
        short_ihl[0] = 0x44;
        assert_eq!(
            decode_ip_header(&short_ihl),
            Err(DecodeError::BadHeaderLength(16))
        );

        let mut long_ihl = good;
        long_ihl[0] = 0x4f;
        assert_eq!(
            decode_ip_header(&long_ihl),
            Err(DecodeError::Truncated { needed: 60, got: 28 })
        );

        let mut short_total = good;
        short_total[2] = 0;
        short_total[3] = 10;
        assert_eq!(
            decode_ip_header(&short_total),
            Err(DecodeError::BadTotalLength {
                total_len: 10,
                header_len: 20
            })
        );

        assert_eq!(
            decode_udp_header(&good[20..27]),
            Err(DecodeError::Truncated { needed: 8, got: 7 })
        );
    }

    #[test]
    fn test_decode_skips_options() {
        let hdr = encode_ip_udp_header(SRC, 1, DST, 2, 0).unwrap();
        let mut buf = hdr[..20].to_vec();
        buf[0] = 0x46; // one word of options
        buf[3] += 4;
        buf.extend_from_slice(&[1, 1, 1, 0]); // NOP, NOP, NOP, EOL
        buf.extend_from_slice(&hdr[20..]);
        let ip = decode_ip_header(&buf).unwrap();
        assert_eq!(ip.header_len, 24);
        let udp = decode_udp_header(&buf[ip.header_len..]).unwrap();
        assert_eq!((udp.src_port, udp.dst_port), (1, 2));
    }
}
