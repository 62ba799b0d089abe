//! Transport endpoint addresses
//!
//! An [`Addr`] names a dial target: an IPv4 or IPv6 literal, or a domain
//! name, plus a port. It parses from `host:port` / `[v6]:port` strings and
//! serializes to a compact binary form for the stream preamble: a one-byte
//! family tag, then a 4/16-byte IP or a length-prefixed domain, then the
//! port in network byte order.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtocolError;

/// Family tag: IPv4 address (4 bytes follow)
pub const ATYP_V4: u8 = 0x01;
/// Family tag: domain name (1-byte length + bytes follow)
pub const ATYP_DOMAIN: u8 = 0x03;
/// Family tag: IPv6 address (16 bytes follow)
pub const ATYP_V6: u8 = 0x04;

/// Maximum domain name length in the compact encoding
const MAX_DOMAIN_LEN: usize = 255;

/// The host half of an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// IPv4 literal
    V4(Ipv4Addr),
    /// IPv6 literal
    V6(Ipv6Addr),
    /// Domain name, resolved by the server at dial time
    Domain(String),
}

/// A transport endpoint: host plus port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    /// Host part
    pub host: Host,
    /// Port part
    pub port: u16,
}

impl Addr {
    /// Create an endpoint from an IP address and port
    #[must_use]
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        let host = match ip {
            IpAddr::V4(v4) => Host::V4(v4),
            IpAddr::V6(v6) => Host::V6(v6),
        };
        Self { host, port }
    }

    /// Create a domain endpoint
    pub fn from_domain(domain: impl Into<String>, port: u16) -> Self {
        Self {
            host: Host::Domain(domain.into()),
            port,
        }
    }

    /// The family tag used in the compact encoding
    #[must_use]
    pub const fn family(&self) -> u8 {
        match self.host {
            Host::V4(_) => ATYP_V4,
            Host::V6(_) => ATYP_V6,
            Host::Domain(_) => ATYP_DOMAIN,
        }
    }

    /// The socket address, if the host is an IP literal
    #[must_use]
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match &self.host {
            Host::V4(v4) => Some(SocketAddr::new(IpAddr::V4(*v4), self.port)),
            Host::V6(v6) => Some(SocketAddr::new(IpAddr::V6(*v6), self.port)),
            Host::Domain(_) => None,
        }
    }

    /// Whether the host is a domain name
    #[must_use]
    pub const fn is_domain(&self) -> bool {
        matches!(self.host, Host::Domain(_))
    }

    /// Append the compact binary form to `buf`
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match &self.host {
            Host::V4(v4) => {
                buf.push(ATYP_V4);
                buf.extend_from_slice(&v4.octets());
            }
            Host::V6(v6) => {
                buf.push(ATYP_V6);
                buf.extend_from_slice(&v6.octets());
            }
            Host::Domain(d) => {
                buf.push(ATYP_DOMAIN);
                debug_assert!(d.len() <= MAX_DOMAIN_LEN);
                buf.push(d.len() as u8);
                buf.extend_from_slice(d.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
    }

    /// Parse the compact binary form, returning the address and the number
    /// of bytes consumed
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let tag = *buf
            .first()
            .ok_or_else(|| ProtocolError::malformed("empty address"))?;
        match tag {
            ATYP_V4 => {
                if buf.len() < 1 + 4 + 2 {
                    return Err(ProtocolError::malformed("truncated IPv4 address"));
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok((
                    Self {
                        host: Host::V4(Ipv4Addr::from(octets)),
                        port,
                    },
                    7,
                ))
            }
            ATYP_V6 => {
                if buf.len() < 1 + 16 + 2 {
                    return Err(ProtocolError::malformed("truncated IPv6 address"));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok((
                    Self {
                        host: Host::V6(Ipv6Addr::from(octets)),
                        port,
                    },
                    19,
                ))
            }
            ATYP_DOMAIN => {
                let len = *buf
                    .get(1)
                    .ok_or_else(|| ProtocolError::malformed("truncated domain length"))?
                    as usize;
                if buf.len() < 2 + len + 2 {
                    return Err(ProtocolError::malformed("truncated domain address"));
                }
                let domain = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| ProtocolError::malformed("domain is not valid UTF-8"))?
                    .to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok((
                    Self {
                        host: Host::Domain(domain),
                        port,
                    },
                    4 + len,
                ))
            }
            other => Err(ProtocolError::malformed(format!(
                "unknown address family tag {other:#04x}"
            ))),
        }
    }
}

impl FromStr for Addr {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Literal socket addresses cover "1.2.3.4:80" and "[::1]:80".
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Ok(Self::from_ip(sa.ip(), sa.port()));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::InvalidAddr(format!("missing port in '{s}'")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ProtocolError::InvalidAddr(format!("invalid port in '{s}'")))?;

        if host.is_empty() || host.len() > MAX_DOMAIN_LEN {
            return Err(ProtocolError::InvalidAddr(format!(
                "invalid host in '{s}'"
            )));
        }
        // A bare colon-free host that failed SocketAddr parsing is a domain.
        if host.contains(':') {
            return Err(ProtocolError::InvalidAddr(format!(
                "IPv6 host must be bracketed in '{s}'"
            )));
        }
        Ok(Self::from_domain(host, port))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::V4(v4) => write!(f, "{}:{}", v4, self.port),
            Host::V6(v6) => write!(f, "[{}]:{}", v6, self.port),
            Host::Domain(d) => write!(f, "{}:{}", d, self.port),
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(sa: SocketAddr) -> Self {
        Self::from_ip(sa.ip(), sa.port())
    }
}

// The preamble embeds addresses as their compact byte form so the wire
// layout stays fixed regardless of the outer encoder.
impl Serialize for Addr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut buf = Vec::with_capacity(19);
        self.encode(&mut buf);
        serializer.serialize_bytes(&buf)
    }
}

struct AddrVisitor;

impl<'de> Visitor<'de> for AddrVisitor {
    type Value = Addr;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("compact address bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        let (addr, used) = Addr::decode(v).map_err(|e| E::custom(e.to_string()))?;
        if used != v.len() {
            return Err(E::custom("trailing bytes after address"));
        }
        Ok(addr)
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut buf = Vec::new();
        while let Some(b) = seq.next_element::<u8>()? {
            buf.push(b);
        }
        self.visit_bytes(&buf)
    }
}

impl<'de> Deserialize<'de> for Addr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(AddrVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let addr: Addr = "127.0.0.1:9001".parse().unwrap();
        assert_eq!(addr.host, Host::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(addr.port, 9001);
        assert_eq!(addr.family(), ATYP_V4);
        assert_eq!(addr.to_string(), "127.0.0.1:9001");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr: Addr = "[::1]:443".parse().unwrap();
        assert_eq!(addr.host, Host::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(addr.port, 443);
        assert_eq!(addr.to_string(), "[::1]:443");
    }

    #[test]
    fn test_parse_domain() {
        let addr: Addr = "example.com:8080".parse().unwrap();
        assert!(addr.is_domain());
        assert_eq!(addr.port, 8080);
        assert!(addr.to_socket_addr().is_none());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("no-port".parse::<Addr>().is_err());
        assert!("host:notaport".parse::<Addr>().is_err());
        assert!("::1:443".parse::<Addr>().is_err());
        assert!(":80".parse::<Addr>().is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let cases = [
            "10.1.2.3:80".parse::<Addr>().unwrap(),
            "[2001:db8::1]:65535".parse::<Addr>().unwrap(),
            "tunnel.example.org:1".parse::<Addr>().unwrap(),
        ];
        for addr in cases {
            let mut buf = Vec::new();
            addr.encode(&mut buf);
            let (decoded, used) = Addr::decode(&buf).unwrap();
            assert_eq!(used, buf.len());
            assert_eq!(decoded, addr);
        }
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let addr: Addr = "10.0.0.1:80".parse().unwrap();
        let mut buf = Vec::new();
        addr.encode(&mut buf);
        for cut in 0..buf.len() {
            assert!(Addr::decode(&buf[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert!(Addr::decode(&[0x09, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_bincode_roundtrip() {
        let addr: Addr = "example.com:443".parse().unwrap();
        let bytes = bincode::serialize(&addr).unwrap();
        let back: Addr = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, addr);
        // Deterministic: same struct, same bytes.
        assert_eq!(bytes, bincode::serialize(&addr).unwrap());
    }
}
