//! Header writer for synthesized carrier frames

use std::net::{IpAddr, SocketAddr};

use super::checksum::{fold, ipv4_header_checksum, pseudo_header_sum_v4, pseudo_header_sum_v6, sum_bytes};
use super::{Carrier, WireError, CARRIER_TTL, IPV4_HEADER_LEN, TCP_CARRIER_FLAGS, TCP_CARRIER_WINDOW, UDP_HEADER_LEN};

/// Everything needed to synthesize one outbound frame
#[derive(Debug, Clone, Copy)]
pub struct FrameSpec<'a> {
    /// Outer carrier
    pub carrier: Carrier,
    /// Source endpoint (the configured bind address and chosen port)
    pub src: SocketAddr,
    /// Destination endpoint (the remote tunnel end)
    pub dst: SocketAddr,
    /// Rolling TCP sequence number; ignored for the UDP carrier
    pub seq: u32,
    /// IPv4 identification field; ignored for IPv6
    pub ident: u16,
    /// The KCP datagram being carried
    pub payload: &'a [u8],
}

/// Build a complete IPv4 frame (IP header + transport header + payload)
/// into `out`, returning the frame length. Used with `IP_HDRINCL` sockets.
pub fn build_ipv4_frame(spec: &FrameSpec<'_>, out: &mut Vec<u8>) -> Result<usize, WireError> {
    let (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) = (spec.src.ip(), spec.dst.ip()) else {
        return Err(WireError::FamilyMismatch);
    };

    let transport_len = spec.carrier.header_len() + spec.payload.len();
    let total_len = IPV4_HEADER_LEN + transport_len;
    if total_len > usize::from(u16::MAX) {
        return Err(WireError::BadHeader("frame exceeds 65535 bytes"));
    }

    out.clear();
    out.reserve(total_len);

    // IPv4 header, no options.
    out.push(0x45);
    out.push(0x00);
    out.extend_from_slice(&(total_len as u16).to_be_bytes());
    out.extend_from_slice(&spec.ident.to_be_bytes());
    out.extend_from_slice(&0x4000u16.to_be_bytes()); // DF
    out.push(CARRIER_TTL);
    out.push(spec.carrier.protocol());
    out.extend_from_slice(&[0, 0]); // checksum placeholder
    out.extend_from_slice(&src_ip.octets());
    out.extend_from_slice(&dst_ip.octets());

    let csum = ipv4_header_checksum(&out[..IPV4_HEADER_LEN]);
    out[10..12].copy_from_slice(&csum.to_be_bytes());

    let pseudo = pseudo_header_sum_v4(src_ip, dst_ip, spec.carrier.protocol(), transport_len as u16);
    push_transport(spec, pseudo, out);

    Ok(total_len)
}

/// Build an IPv6 transport segment (transport header + payload, no IP
/// header) into `out`, returning the segment length. Raw IPv6 sockets have
/// the kernel add the IP header; the checksum still covers the v6
/// pseudo-header, so both addresses are needed here.
pub fn build_ipv6_segment(spec: &FrameSpec<'_>, out: &mut Vec<u8>) -> Result<usize, WireError> {
    let (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) = (spec.src.ip(), spec.dst.ip()) else {
        return Err(WireError::FamilyMismatch);
    };

    let transport_len = spec.carrier.header_len() + spec.payload.len();
    if transport_len > usize::from(u16::MAX) {
        return Err(WireError::BadHeader("segment exceeds 65535 bytes"));
    }

    out.clear();
    out.reserve(transport_len);

    let pseudo = pseudo_header_sum_v6(src_ip, dst_ip, spec.carrier.protocol(), transport_len as u32);
    push_transport(spec, pseudo, out);

    Ok(transport_len)
}

/// Append the transport header + payload, computing the checksum from the
/// caller's pseudo-header sum.
fn push_transport(spec: &FrameSpec<'_>, pseudo_sum: u32, out: &mut Vec<u8>) {
    let start = out.len();
    match spec.carrier {
        Carrier::Tcp => {
            out.extend_from_slice(&spec.src.port().to_be_bytes());
            out.extend_from_slice(&spec.dst.port().to_be_bytes());
            out.extend_from_slice(&spec.seq.to_be_bytes());
            out.extend_from_slice(&0u32.to_be_bytes()); // ack
            out.push(0x50); // data offset 5 words
            out.push(TCP_CARRIER_FLAGS);
            out.extend_from_slice(&TCP_CARRIER_WINDOW.to_be_bytes());
            out.extend_from_slice(&[0, 0]); // checksum placeholder
            out.extend_from_slice(&[0, 0]); // urgent pointer
            out.extend_from_slice(spec.payload);

            let csum = fold(pseudo_sum + sum_bytes(&out[start..]));
            out[start + 16..start + 18].copy_from_slice(&csum.to_be_bytes());
        }
        Carrier::Udp => {
            let len = (UDP_HEADER_LEN + spec.payload.len()) as u16;
            out.extend_from_slice(&spec.src.port().to_be_bytes());
            out.extend_from_slice(&spec.dst.port().to_be_bytes());
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(&[0, 0]); // checksum placeholder
            out.extend_from_slice(spec.payload);

            let mut csum = fold(pseudo_sum + sum_bytes(&out[start..]));
            // A computed zero is transmitted as all-ones (RFC 768).
            if csum == 0 {
                csum = 0xFFFF;
            }
            out[start + 6..start + 8].copy_from_slice(&csum.to_be_bytes());
        }
    }
    debug_assert_eq!(out.len() - start, spec.carrier.header_len() + spec.payload.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::checksum::sum_bytes as sum;
    use crate::wire::TCP_HEADER_LEN;

    fn v4_spec<'a>(carrier: Carrier, payload: &'a [u8]) -> FrameSpec<'a> {
        FrameSpec {
            carrier,
            src: "192.168.0.1:40000".parse().unwrap(),
            dst: "10.0.0.2:443".parse().unwrap(),
            seq: 0x11223344,
            ident: 7,
            payload,
        }
    }

    #[test]
    fn test_ipv4_tcp_frame_layout() {
        let payload = b"hello kcp";
        let mut out = Vec::new();
        let n = build_ipv4_frame(&v4_spec(Carrier::Tcp, payload), &mut out).unwrap();
        assert_eq!(n, out.len());
        assert_eq!(n, IPV4_HEADER_LEN + TCP_HEADER_LEN + payload.len());

        assert_eq!(out[0], 0x45);
        assert_eq!(out[9], 6); // protocol TCP
        assert_eq!(&out[12..16], &[192, 168, 0, 1]);
        assert_eq!(&out[16..20], &[10, 0, 0, 2]);

        let tcp = &out[IPV4_HEADER_LEN..];
        assert_eq!(u16::from_be_bytes([tcp[0], tcp[1]]), 40000);
        assert_eq!(u16::from_be_bytes([tcp[2], tcp[3]]), 443);
        assert_eq!(u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]), 0x11223344);
        assert_eq!(tcp[13], TCP_CARRIER_FLAGS);
        assert_eq!(&tcp[TCP_HEADER_LEN..], payload);
    }

    #[test]
    fn test_ipv4_header_checksum_valid() {
        let mut out = Vec::new();
        build_ipv4_frame(&v4_spec(Carrier::Udp, b"x"), &mut out).unwrap();
        // Folding a valid header including its checksum yields zero.
        assert_eq!(fold(sum(&out[..IPV4_HEADER_LEN])), 0);
    }

    #[test]
    fn test_tcp_checksum_valid() {
        let mut out = Vec::new();
        build_ipv4_frame(&v4_spec(Carrier::Tcp, b"abcde"), &mut out).unwrap();
        let transport = &out[IPV4_HEADER_LEN..];
        let pseudo = pseudo_header_sum_v4(
            "192.168.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            6,
            transport.len() as u16,
        );
        assert_eq!(fold(pseudo + sum(transport)), 0);
    }

    #[test]
    fn test_udp_checksum_valid() {
        let mut out = Vec::new();
        build_ipv4_frame(&v4_spec(Carrier::Udp, b"datagram"), &mut out).unwrap();
        let transport = &out[IPV4_HEADER_LEN..];
        assert_eq!(
            u16::from_be_bytes([transport[4], transport[5]]) as usize,
            transport.len()
        );
        let pseudo = pseudo_header_sum_v4(
            "192.168.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            17,
            transport.len() as u16,
        );
        assert_eq!(fold(pseudo + sum(transport)), 0);
    }

    #[test]
    fn test_ipv6_udp_segment() {
        let spec = FrameSpec {
            carrier: Carrier::Udp,
            src: "[2001:db8::1]:50000".parse().unwrap(),
            dst: "[2001:db8::2]:9000".parse().unwrap(),
            seq: 0,
            ident: 0,
            payload: b"v6 payload",
        };
        let mut out = Vec::new();
        let n = build_ipv6_segment(&spec, &mut out).unwrap();
        assert_eq!(n, UDP_HEADER_LEN + spec.payload.len());

        let pseudo = pseudo_header_sum_v6(
            "2001:db8::1".parse().unwrap(),
            "2001:db8::2".parse().unwrap(),
            17,
            out.len() as u32,
        );
        assert_eq!(fold(pseudo + sum(&out)), 0);
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let spec = FrameSpec {
            carrier: Carrier::Tcp,
            src: "[::1]:1".parse().unwrap(),
            dst: "127.0.0.1:2".parse().unwrap(),
            seq: 0,
            ident: 0,
            payload: b"",
        };
        let mut out = Vec::new();
        assert!(matches!(
            build_ipv4_frame(&spec, &mut out),
            Err(WireError::FamilyMismatch)
        ));
        assert!(matches!(
            build_ipv6_segment(&spec, &mut out),
            Err(WireError::FamilyMismatch)
        ));
    }

    #[test]
    fn test_empty_payload_frames() {
        let mut out = Vec::new();
        let n = build_ipv4_frame(&v4_spec(Carrier::Tcp, b""), &mut out).unwrap();
        assert_eq!(n, IPV4_HEADER_LEN + TCP_HEADER_LEN);
        let n = build_ipv4_frame(&v4_spec(Carrier::Udp, b""), &mut out).unwrap();
        assert_eq!(n, IPV4_HEADER_LEN + UDP_HEADER_LEN);
    }
}
