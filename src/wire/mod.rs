//! Outer packet framing
//!
//! The tunnel does not use the OS transport stack for its carrier traffic.
//! Every KCP datagram is wrapped in a synthesized IPv4/IPv6 + TCP or UDP
//! frame so the tunnel resembles ordinary traffic to on-path middleboxes.
//! This module is the header writer and header parser for those frames,
//! written as pure functions over byte slices and kept isolated from the
//! socket so they can be tested offline.
//!
//! Egress shape:
//!
//! ```text
//! IPv4: [IP header 20][TCP 20 | UDP 8][payload]   (written with IP_HDRINCL)
//! IPv6: [TCP 20 | UDP 8][payload]                 (kernel adds the IP header)
//! ```
//!
//! The TCP carrier uses fixed PSH|ACK flags and a rolling sequence number
//! advanced by payload length; checksums follow the standard pseudo-header
//! rules for both families.

mod build;
mod checksum;
mod parse;

pub use build::{build_ipv4_frame, build_ipv6_segment, FrameSpec};
pub use checksum::{fold, ipv4_header_checksum, pseudo_header_sum_v4, pseudo_header_sum_v6, sum_bytes};
pub use parse::{parse_ipv4_frame, parse_segment, ParsedFrame, ParsedSegment};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// IPv4 header length (no options are ever emitted or accepted)
pub const IPV4_HEADER_LEN: usize = 20;
/// IPv6 fixed header length
pub const IPV6_HEADER_LEN: usize = 40;
/// TCP header length (no options)
pub const TCP_HEADER_LEN: usize = 20;
/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// TCP carrier flags: PSH|ACK, the shape of an established flow
pub const TCP_CARRIER_FLAGS: u8 = 0x18;
/// TCP carrier advertised window
pub const TCP_CARRIER_WINDOW: u16 = 0xFFFF;
/// TTL / hop limit on synthesized frames
pub const CARRIER_TTL: u8 = 64;

/// Outer transport carrier selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Carrier {
    /// Forged TCP segments
    Tcp,
    /// Plain UDP datagrams
    Udp,
}

impl Carrier {
    /// IP protocol number of the carrier
    #[must_use]
    pub const fn protocol(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }

    /// Transport header length of the carrier
    #[must_use]
    pub const fn header_len(self) -> usize {
        match self {
            Self::Tcp => TCP_HEADER_LEN,
            Self::Udp => UDP_HEADER_LEN,
        }
    }
}

impl std::fmt::Display for Carrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Errors from frame parsing
#[derive(Debug, Clone, Error)]
pub enum WireError {
    /// Frame shorter than its headers claim
    #[error("Frame truncated: {0} bytes")]
    Truncated(usize),

    /// Not an IPv4 frame
    #[error("Unexpected IP version: {0}")]
    Version(u8),

    /// The IP protocol field does not match the expected carrier
    #[error("Unexpected IP protocol: {got} (want {want})")]
    Protocol { got: u8, want: u8 },

    /// Source/destination address families disagree
    #[error("Address family mismatch")]
    FamilyMismatch,

    /// Header fields are internally inconsistent
    #[error("Bad header: {0}")]
    BadHeader(&'static str),
}
