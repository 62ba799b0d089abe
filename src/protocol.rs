//! Stream preamble protocol
//!
//! The first frame on every client-opened stream is a [`Proto`] message
//! telling the server what the stream is for: liveness ping/pong, a TCP or
//! UDP bridge to a target, or forward-rule registration. The preamble is
//! written exactly once, before any payload byte, and read exactly once;
//! everything after it is opaque bytes.
//!
//! Encoding: a little-endian `u16` length prefix, then the bincode bytes
//! of the message. Bincode with fixed-width integers is deterministic
//! (same struct, same bytes) and versionable by appending fields.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ForwardRule;
use crate::error::ProtocolError;
use crate::net::Addr;

/// Upper bound on an encoded preamble; anything larger is malformed
pub const MAX_PREAMBLE: usize = 8 * 1024;

/// Preamble message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ProtoKind {
    /// Liveness probe; the peer answers with `Pong` on the same stream
    Ping,
    /// Liveness answer
    Pong,
    /// Forward-rule registration for the session
    TcpForward,
    /// Bridge this stream to a TCP target
    Tcp,
    /// Bridge this stream to a UDP target, datagram-for-datagram
    Udp,
}

impl From<ProtoKind> for u8 {
    fn from(kind: ProtoKind) -> Self {
        match kind {
            ProtoKind::Ping => 1,
            ProtoKind::Pong => 2,
            ProtoKind::TcpForward => 3,
            ProtoKind::Tcp => 4,
            ProtoKind::Udp => 5,
        }
    }
}

impl TryFrom<u8> for ProtoKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Ping),
            2 => Ok(Self::Pong),
            3 => Ok(Self::TcpForward),
            4 => Ok(Self::Tcp),
            5 => Ok(Self::Udp),
            other => Err(format!("unknown preamble type {other}")),
        }
    }
}

/// The stream preamble
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proto {
    /// Message type
    pub kind: ProtoKind,
    /// Target endpoint; required for `Tcp` and `Udp`
    pub addr: Option<Addr>,
    /// Forward rules carried by `TcpForward`
    pub tcpf: Option<Vec<ForwardRule>>,
}

impl Proto {
    /// A liveness probe
    #[must_use]
    pub const fn ping() -> Self {
        Self {
            kind: ProtoKind::Ping,
            addr: None,
            tcpf: None,
        }
    }

    /// A liveness answer
    #[must_use]
    pub const fn pong() -> Self {
        Self {
            kind: ProtoKind::Pong,
            addr: None,
            tcpf: None,
        }
    }

    /// A TCP bridge request
    #[must_use]
    pub const fn tcp(addr: Addr) -> Self {
        Self {
            kind: ProtoKind::Tcp,
            addr: Some(addr),
            tcpf: None,
        }
    }

    /// A UDP bridge request
    #[must_use]
    pub const fn udp(addr: Addr) -> Self {
        Self {
            kind: ProtoKind::Udp,
            addr: Some(addr),
            tcpf: None,
        }
    }

    /// A forward-rule registration
    #[must_use]
    pub const fn tcp_forward(rules: Vec<ForwardRule>) -> Self {
        Self {
            kind: ProtoKind::TcpForward,
            addr: None,
            tcpf: Some(rules),
        }
    }

    /// Check type-specific required fields
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self.kind {
            ProtoKind::Tcp | ProtoKind::Udp if self.addr.is_none() => {
                Err(ProtocolError::MissingField {
                    kind: self.kind.into(),
                    field: "addr",
                })
            }
            ProtoKind::TcpForward if self.tcpf.is_none() => Err(ProtocolError::MissingField {
                kind: self.kind.into(),
                field: "tcpf",
            }),
            _ => Ok(()),
        }
    }
}

/// Write one preamble to the stream and flush it
pub async fn write_proto<W>(w: &mut W, proto: &Proto) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(proto).map_err(|e| ProtocolError::malformed(e.to_string()))?;
    if body.len() > MAX_PREAMBLE {
        return Err(ProtocolError::TooLarge {
            len: body.len(),
            max: MAX_PREAMBLE,
        });
    }
    let mut frame = Vec::with_capacity(2 + body.len());
    frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
    frame.extend_from_slice(&body);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Read exactly one preamble from the stream
pub async fn read_proto<R>(r: &mut R) -> Result<Proto, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    r.read_exact(&mut len_buf).await?;
    let len = usize::from(u16::from_le_bytes(len_buf));
    if len == 0 {
        return Err(ProtocolError::malformed("empty preamble"));
    }
    if len > MAX_PREAMBLE {
        return Err(ProtocolError::TooLarge {
            len,
            max: MAX_PREAMBLE,
        });
    }

    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;

    let proto: Proto =
        bincode::deserialize(&body).map_err(|e| ProtocolError::malformed(e.to_string()))?;
    proto.validate()?;
    Ok(proto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwardProto;

    fn all_variants() -> Vec<Proto> {
        vec![
            Proto::ping(),
            Proto::pong(),
            Proto::tcp("10.0.0.1:80".parse().unwrap()),
            Proto::udp("[::1]:53".parse().unwrap()),
            Proto::tcp("example.com:443".parse().unwrap()),
            Proto::tcp_forward(vec![ForwardRule {
                listen: "127.0.0.1:7001".into(),
                target: "127.0.0.1:9001".into(),
                protocol: ForwardProto::Tcp,
            }]),
        ]
    }

    #[tokio::test]
    async fn test_encode_decode_identity() {
        for proto in all_variants() {
            let (mut a, mut b) = tokio::io::duplex(4096);
            write_proto(&mut a, &proto).await.unwrap();
            let decoded = read_proto(&mut b).await.unwrap();
            assert_eq!(decoded, proto);
        }
    }

    #[test]
    fn test_encoding_is_deterministic() {
        for proto in all_variants() {
            let first = bincode::serialize(&proto).unwrap();
            let second = bincode::serialize(&proto).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_kind_wire_values() {
        assert_eq!(u8::from(ProtoKind::Ping), 1);
        assert_eq!(u8::from(ProtoKind::Pong), 2);
        assert_eq!(u8::from(ProtoKind::TcpForward), 3);
        assert_eq!(u8::from(ProtoKind::Tcp), 4);
        assert_eq!(u8::from(ProtoKind::Udp), 5);
        assert!(ProtoKind::try_from(0).is_err());
        assert!(ProtoKind::try_from(6).is_err());
    }

    #[tokio::test]
    async fn test_garbage_is_malformed() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        // A plausible length prefix followed by noise.
        tokio::io::AsyncWriteExt::write_all(&mut a, &62u16.to_le_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, &[0xA5u8; 62])
            .await
            .unwrap();
        assert!(read_proto(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_oversize_preamble_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut a, &u16::MAX.to_le_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_proto(&mut b).await,
            Err(ProtocolError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_missing_addr_rejected() {
        let proto = Proto {
            kind: ProtoKind::Tcp,
            addr: None,
            tcpf: None,
        };
        assert!(matches!(
            proto.validate(),
            Err(ProtocolError::MissingField { field: "addr", .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_body_fails() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut a, &100u16.to_le_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut a, &[1u8; 10]).await.unwrap();
        drop(a);
        assert!(read_proto(&mut b).await.is_err());
    }
}
