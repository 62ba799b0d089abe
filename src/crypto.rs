//! Per-datagram payload encryption
//!
//! Every KCP datagram is sealed under the pre-shared 32-byte key before it
//! is handed to the packet transport, and opened after ingress filtering.
//! There is no in-band negotiation: both ends must configure the same
//! `kcp.block` cipher, and datagrams that fail to open are dropped the same
//! way as any other non-matching packet.
//!
//! Wire shape per datagram: `nonce (12) || ciphertext+tag`.

use std::io;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};

/// Nonce prefix length
const NONCE_LEN: usize = 12;
/// AEAD authentication tag length
const TAG_LEN: usize = 16;

/// Cipher selection for the `kcp.block` config key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CipherKind {
    /// No payload encryption
    None,
    /// ChaCha20-Poly1305 AEAD under the shared 32-byte key
    #[default]
    Chacha20Poly1305,
}

/// Seals and opens individual datagrams
pub enum DatagramCipher {
    /// Pass-through
    Plain,
    /// AEAD-sealed datagrams
    Sealed(Box<ChaCha20Poly1305>),
}

impl DatagramCipher {
    /// Build a cipher from the configured kind and key
    #[must_use]
    pub fn new(kind: CipherKind, key: &[u8; 32]) -> Self {
        match kind {
            CipherKind::None => Self::Plain,
            CipherKind::Chacha20Poly1305 => {
                Self::Sealed(Box::new(ChaCha20Poly1305::new(Key::from_slice(key))))
            }
        }
    }

    /// Bytes added to each datagram by this cipher
    #[must_use]
    pub const fn overhead(&self) -> usize {
        match self {
            Self::Plain => 0,
            Self::Sealed(_) => NONCE_LEN + TAG_LEN,
        }
    }

    /// Seal one datagram for the wire
    pub fn seal(&self, payload: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Plain => Ok(payload.to_vec()),
            Self::Sealed(cipher) => {
                let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
                let ct = cipher
                    .encrypt(&nonce, payload)
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "datagram seal failed"))?;
                let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ct);
                Ok(out)
            }
        }
    }

    /// Open one datagram from the wire; `None` means drop it
    #[must_use]
    pub fn open(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        match self {
            Self::Plain => Some(datagram.to_vec()),
            Self::Sealed(cipher) => {
                if datagram.len() < NONCE_LEN + TAG_LEN {
                    return None;
                }
                let (nonce, ct) = datagram.split_at(NONCE_LEN);
                cipher.decrypt(Nonce::from_slice(nonce), ct).ok()
            }
        }
    }
}

impl std::fmt::Debug for DatagramCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => f.write_str("DatagramCipher::Plain"),
            Self::Sealed(_) => f.write_str("DatagramCipher::Sealed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = DatagramCipher::new(CipherKind::Chacha20Poly1305, &KEY);
        let payload = b"kcp segment bytes";
        let sealed = cipher.seal(payload).unwrap();
        assert_eq!(sealed.len(), payload.len() + cipher.overhead());
        assert_eq!(cipher.open(&sealed).unwrap(), payload);
    }

    #[test]
    fn test_nonce_varies() {
        let cipher = DatagramCipher::new(CipherKind::Chacha20Poly1305, &KEY);
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tamper_rejected() {
        let cipher = DatagramCipher::new(CipherKind::Chacha20Poly1305, &KEY);
        let mut sealed = cipher.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.open(&sealed).is_none());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let cipher = DatagramCipher::new(CipherKind::Chacha20Poly1305, &KEY);
        let other = DatagramCipher::new(CipherKind::Chacha20Poly1305, &[8u8; 32]);
        let sealed = cipher.seal(b"payload").unwrap();
        assert!(other.open(&sealed).is_none());
    }

    #[test]
    fn test_short_datagram_rejected() {
        let cipher = DatagramCipher::new(CipherKind::Chacha20Poly1305, &KEY);
        assert!(cipher.open(&[0u8; 10]).is_none());
    }

    #[test]
    fn test_plain_passthrough() {
        let cipher = DatagramCipher::new(CipherKind::None, &KEY);
        assert_eq!(cipher.overhead(), 0);
        let sealed = cipher.seal(b"clear").unwrap();
        assert_eq!(sealed, b"clear");
        assert_eq!(cipher.open(&sealed).unwrap(), b"clear");
    }
}
