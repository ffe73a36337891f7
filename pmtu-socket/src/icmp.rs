//! # ICMP Message Interpretation
//!
//! Turns the body of an inbound ICMP message into a `Diagnostic` an operator can read:
//! for "destination unreachable" messages the destination of the quoted original
//! packet, and for "fragmentation needed" additionally the next-hop MTU. Parsing of
//! the ICMP header itself is left to `etherparse`; the quoted IPv4 header goes through
//! this crate's own decoder, which tolerates the truncation ICMP quoting implies.

use std::fmt;
use std::net::Ipv4Addr;

use etherparse::icmpv4::DestUnreachableHeader;
use etherparse::{Icmpv4Slice, Icmpv4Type};

use crate::header::decode_ip_header;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Type 3, code 4: the packet needs fragmenting but had DF set.
    FragmentationNeeded {
        destination: Ipv4Addr,
        next_hop_mtu: u16,
    },
    /// Any other destination unreachable code.
    Unreachable { destination: Ipv4Addr, code: u8 },
    Other { icmp_type: u8, code: u8, len: usize },
    /// The message could not be parsed.
    Malformed(String),
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::FragmentationNeeded {
                destination,
                next_hop_mtu,
            } => write!(
                f,
                "ICMP: destination ({destination}) unreachable; fragmentation needed (mtu={next_hop_mtu})"
            ),
            Diagnostic::Unreachable { destination, code } => {
                write!(f, "ICMP: destination ({destination}) unreachable (code={code})")
            }
            Diagnostic::Other {
                icmp_type,
                code,
                len,
            } => write!(f, "ICMP message: type={icmp_type}, code={code}, size={len}"),
            Diagnostic::Malformed(reason) => f.write_str(reason),
        }
    }
}

/// Interprets an ICMP message body (starting at the type byte). Never fails; input that
/// cannot be parsed yields `Diagnostic::Malformed`.
pub fn interpret(body: &[u8]) -> Diagnostic {
    let icmp = match Icmpv4Slice::from_slice(body) {
        Ok(icmp) => icmp,
        Err(e) => return Diagnostic::Malformed(format!("invalid ICMP message: {e}")),
    };
    match icmp.icmp_type() {
        Icmpv4Type::DestinationUnreachable(header) => {
            let original = match decode_ip_header(icmp.payload()) {
                Ok(original) => original,
                Err(e) => {
                    return Diagnostic::Malformed(format!(
                        "invalid IP header inside ICMP unreachable message: {e}"
                    ));
                }
            };
            match header {
                DestUnreachableHeader::FragmentationNeeded { next_hop_mtu } => {
                    Diagnostic::FragmentationNeeded {
                        destination: original.dst,
                        next_hop_mtu,
                    }
                }
                _ => Diagnostic::Unreachable {
                    destination: original.dst,
                    code: icmp.code_u8(),
                },
            }
        }
        _ => Diagnostic::Other {
            icmp_type: icmp.type_u8(),
            code: icmp.code_u8(),
            len: body.len(),
        },
    }
}

/// Logs the interpretation of an ICMP message received from `source`.
pub fn log_icmp_message(source: Ipv4Addr, body: &[u8]) -> Diagnostic {
    let diagnostic = interpret(body);
    match &diagnostic {
        Diagnostic::Malformed(_) => log::warn!("{source}: {diagnostic}"),
        _ => log::info!("{source}: {diagnostic}"),
    }
    diagnostic
}
