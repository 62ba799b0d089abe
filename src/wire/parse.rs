//! Header parser for inbound carrier frames
//!
//! Ingress filtering works on two shapes: IPv4 raw sockets deliver the full
//! IP frame, IPv6 raw sockets deliver only the transport segment (the
//! kernel strips the IP header and the peer address comes from `recvfrom`).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::Range;

use super::{Carrier, WireError, IPV4_HEADER_LEN, UDP_HEADER_LEN};

/// A parsed IPv4 carrier frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    /// Source endpoint from the IP and transport headers
    pub src: SocketAddr,
    /// Destination endpoint from the IP and transport headers
    pub dst: SocketAddr,
    /// Payload byte range within the input frame
    pub payload: Range<usize>,
}

/// A parsed transport segment (IPv6 ingress; no IP header present)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSegment {
    /// Source port from the transport header
    pub src_port: u16,
    /// Destination port from the transport header
    pub dst_port: u16,
    /// Payload byte range within the input segment
    pub payload: Range<usize>,
}

/// Parse a full IPv4 frame and locate the carried KCP datagram.
///
/// Frames that are not IPv4, do not carry the expected protocol, or are
/// internally inconsistent are rejected; the caller drops them silently.
pub fn parse_ipv4_frame(carrier: Carrier, buf: &[u8]) -> Result<ParsedFrame, WireError> {
    if buf.len() < IPV4_HEADER_LEN {
        return Err(WireError::Truncated(buf.len()));
    }
    let version = buf[0] >> 4;
    if version != 4 {
        return Err(WireError::Version(version));
    }
    let ihl = usize::from(buf[0] & 0x0F) * 4;
    if ihl < IPV4_HEADER_LEN || buf.len() < ihl {
        return Err(WireError::BadHeader("IHL out of range"));
    }
    let proto = buf[9];
    if proto != carrier.protocol() {
        return Err(WireError::Protocol {
            got: proto,
            want: carrier.protocol(),
        });
    }
    let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    if total_len < ihl || total_len > buf.len() {
        return Err(WireError::BadHeader("total length out of range"));
    }

    let src_ip = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let dst_ip = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);

    let seg = parse_segment(carrier, &buf[ihl..total_len])?;
    Ok(ParsedFrame {
        src: SocketAddr::new(IpAddr::V4(src_ip), seg.src_port),
        dst: SocketAddr::new(IpAddr::V4(dst_ip), seg.dst_port),
        payload: ihl + seg.payload.start..ihl + seg.payload.end,
    })
}

/// Parse a bare transport segment and locate the carried KCP datagram.
pub fn parse_segment(carrier: Carrier, buf: &[u8]) -> Result<ParsedSegment, WireError> {
    match carrier {
        Carrier::Tcp => {
            if buf.len() < 20 {
                return Err(WireError::Truncated(buf.len()));
            }
            let data_off = usize::from(buf[12] >> 4) * 4;
            if data_off < 20 || buf.len() < data_off {
                return Err(WireError::BadHeader("TCP data offset out of range"));
            }
            Ok(ParsedSegment {
                src_port: u16::from_be_bytes([buf[0], buf[1]]),
                dst_port: u16::from_be_bytes([buf[2], buf[3]]),
                payload: data_off..buf.len(),
            })
        }
        Carrier::Udp => {
            if buf.len() < UDP_HEADER_LEN {
                return Err(WireError::Truncated(buf.len()));
            }
            let len = usize::from(u16::from_be_bytes([buf[4], buf[5]]));
            if len < UDP_HEADER_LEN || len > buf.len() {
                return Err(WireError::BadHeader("UDP length out of range"));
            }
            Ok(ParsedSegment {
                src_port: u16::from_be_bytes([buf[0], buf[1]]),
                dst_port: u16::from_be_bytes([buf[2], buf[3]]),
                payload: UDP_HEADER_LEN..len,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::build::{build_ipv4_frame, build_ipv6_segment, FrameSpec};

    fn spec<'a>(carrier: Carrier, payload: &'a [u8]) -> FrameSpec<'a> {
        FrameSpec {
            carrier,
            src: "172.16.0.9:41000".parse().unwrap(),
            dst: "203.0.113.4:8443".parse().unwrap(),
            seq: 1000,
            ident: 42,
            payload,
        }
    }

    #[test]
    fn test_build_parse_roundtrip_tcp() {
        let payload = b"segment payload bytes";
        let mut out = Vec::new();
        build_ipv4_frame(&spec(Carrier::Tcp, payload), &mut out).unwrap();

        let parsed = parse_ipv4_frame(Carrier::Tcp, &out).unwrap();
        assert_eq!(parsed.src, "172.16.0.9:41000".parse().unwrap());
        assert_eq!(parsed.dst, "203.0.113.4:8443".parse().unwrap());
        assert_eq!(&out[parsed.payload], payload);
    }

    #[test]
    fn test_build_parse_roundtrip_udp() {
        let payload = b"udp carried";
        let mut out = Vec::new();
        build_ipv4_frame(&spec(Carrier::Udp, payload), &mut out).unwrap();

        let parsed = parse_ipv4_frame(Carrier::Udp, &out).unwrap();
        assert_eq!(&out[parsed.payload], payload);
    }

    #[test]
    fn test_v6_segment_roundtrip() {
        let s = FrameSpec {
            carrier: Carrier::Tcp,
            src: "[2001:db8::9]:41000".parse().unwrap(),
            dst: "[2001:db8::4]:8443".parse().unwrap(),
            seq: 55,
            ident: 0,
            payload: b"six",
        };
        let mut out = Vec::new();
        build_ipv6_segment(&s, &mut out).unwrap();

        let seg = parse_segment(Carrier::Tcp, &out).unwrap();
        assert_eq!(seg.src_port, 41000);
        assert_eq!(seg.dst_port, 8443);
        assert_eq!(&out[seg.payload], b"six");
    }

    #[test]
    fn test_protocol_mismatch_rejected() {
        let mut out = Vec::new();
        build_ipv4_frame(&spec(Carrier::Tcp, b"x"), &mut out).unwrap();
        assert!(matches!(
            parse_ipv4_frame(Carrier::Udp, &out),
            Err(WireError::Protocol { got: 6, want: 17 })
        ));
    }

    #[test]
    fn test_non_ipv4_rejected() {
        let mut out = Vec::new();
        build_ipv4_frame(&spec(Carrier::Tcp, b"x"), &mut out).unwrap();
        out[0] = 0x65;
        assert!(matches!(
            parse_ipv4_frame(Carrier::Tcp, &out),
            Err(WireError::Version(6))
        ));
    }

    #[test]
    fn test_truncation_rejected() {
        let mut out = Vec::new();
        build_ipv4_frame(&spec(Carrier::Tcp, b"payload"), &mut out).unwrap();
        for cut in 0..IPV4_HEADER_LEN + 20 {
            assert!(parse_ipv4_frame(Carrier::Tcp, &out[..cut]).is_err(), "cut {cut}");
        }
    }

    #[test]
    fn test_bad_total_length_rejected() {
        let mut out = Vec::new();
        build_ipv4_frame(&spec(Carrier::Udp, b"abc"), &mut out).unwrap();
        // Claim more bytes than the buffer holds.
        let bogus = (out.len() as u16 + 8).to_be_bytes();
        out[2..4].copy_from_slice(&bogus);
        assert!(parse_ipv4_frame(Carrier::Udp, &out).is_err());
    }

    #[test]
    fn test_bad_udp_length_rejected() {
        let seg = [0u8, 1, 0, 2, 0, 3, 0, 0]; // UDP length 3 < header size
        assert!(parse_segment(Carrier::Udp, &seg).is_err());
    }

    #[test]
    fn test_tcp_options_skipped() {
        // Hand-build a segment with an 8-word data offset.
        let mut seg = vec![0u8; 32 + 4];
        seg[0..2].copy_from_slice(&100u16.to_be_bytes());
        seg[2..4].copy_from_slice(&200u16.to_be_bytes());
        seg[12] = 0x80; // data offset 8 words = 32 bytes
        seg[32..].copy_from_slice(b"tail");
        let parsed = parse_segment(Carrier::Tcp, &seg).unwrap();
        assert_eq!(&seg[parsed.payload], b"tail");
    }
}
