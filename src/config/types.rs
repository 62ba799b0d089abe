//! Configuration types for phantom-proxy

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::crypto::CipherKind;
use crate::error::ConfigError;
use crate::net::Addr;
use crate::wire::Carrier;

/// Smallest accepted packet socket buffer
pub const MIN_SOCKBUF: usize = 1024;
/// Largest accepted packet socket buffer; oversize values are clamped
pub const MAX_SOCKBUF: usize = 100 * 1024 * 1024;

/// Top-level role selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accept local connections and forward them through the tunnel
    Client,
    /// Accept tunnel sessions and dial targets
    Server,
}

/// Forwarded protocol of a `forward[]` rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardProto {
    /// Local TCP listener
    Tcp,
    /// Local UDP socket
    Udp,
}

impl std::fmt::Display for ForwardProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Udp => f.write_str("udp"),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Role: client or server
    pub role: Role,

    /// Parallel session settings (client side)
    #[serde(default)]
    pub transport: TransportConfig,

    /// KCP endpoint settings
    #[serde(default)]
    pub kcp: KcpSettings,

    /// Stream multiplexer settings
    #[serde(default)]
    pub mux: MuxSettings,

    /// Packet socket settings
    #[serde(default)]
    pub pcap: PcapSettings,

    /// Source address bindings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Remote endpoint (client) or local bind endpoint (server)
    pub server: ServerSettings,

    /// Local forward rules (client side)
    #[serde(default)]
    pub forward: Vec<ForwardRule>,

    /// Shared symmetric key
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Parallel session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Number of parallel sessions a client maintains
    #[serde(default = "default_conn")]
    pub conn: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            conn: default_conn(),
        }
    }
}

/// KCP endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KcpSettings {
    /// Symmetric cipher for datagram payloads
    #[serde(default)]
    pub block: CipherKind,

    /// FEC data shards
    #[serde(default)]
    pub dshard: u8,

    /// FEC parity shards
    #[serde(default)]
    pub pshard: u8,

    /// Send/receive window in segments
    #[serde(default = "default_window")]
    pub window: u32,

    /// Nodelay tuning
    #[serde(default)]
    pub nodelay: NodelayConfig,

    /// Carrier MTU the synthesized frames must fit into
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

impl Default for KcpSettings {
    fn default() -> Self {
        Self {
            block: CipherKind::default(),
            dshard: 0,
            pshard: 0,
            window: default_window(),
            nodelay: NodelayConfig::default(),
            mtu: default_mtu(),
        }
    }
}

/// KCP nodelay tuning knobs
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodelayConfig {
    /// Enable nodelay mode
    #[serde(default = "default_true")]
    pub nodelay: bool,
    /// Internal update interval in milliseconds
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Fast resend threshold
    #[serde(default = "default_resend")]
    pub resend: u32,
    /// Disable congestion control
    #[serde(default = "default_true")]
    pub nc: bool,
}

impl Default for NodelayConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            interval: default_interval(),
            resend: default_resend(),
            nc: true,
        }
    }
}

/// Stream multiplexer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxSettings {
    /// Keepalive ping interval in seconds; drives the pool ticker
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,

    /// Maximum concurrent streams per session
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,

    /// Largest chunk written to a stream in one frame
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            keepalive: default_keepalive(),
            max_streams: default_max_streams(),
            frame_size: default_frame_size(),
        }
    }
}

/// Packet socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PcapSettings {
    /// `SO_RCVBUF`/`SO_SNDBUF` in bytes; defaulted per role
    #[serde(default)]
    pub sockbuf: usize,

    /// Outer carrier protocol
    #[serde(default = "default_carrier")]
    pub carrier: Carrier,
}

impl Default for PcapSettings {
    fn default() -> Self {
        Self {
            sockbuf: 0,
            carrier: default_carrier(),
        }
    }
}

/// Source address bindings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkConfig {
    /// IPv4 source binding
    #[serde(default)]
    pub ipv4: BindConfig,
    /// IPv6 source binding
    #[serde(default)]
    pub ipv6: BindConfig,
}

/// One source address binding
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BindConfig {
    /// Source IP literal, if bound
    #[serde(default)]
    pub addr: Option<IpAddr>,
}

/// Remote (client) or local (server) tunnel endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// `ip:port` literal; raw header synthesis requires an IP, not a name
    pub addr: String,
}

impl ServerSettings {
    /// Parse the endpoint
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr.parse().map_err(|_| {
            ConfigError::validation(format!(
                "server.addr '{}' must be an ip:port literal",
                self.addr
            ))
        })
    }
}

/// One local forward rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    /// Local listen endpoint
    pub listen: String,
    /// Tunnel target endpoint
    pub target: String,
    /// Forwarded protocol
    pub protocol: ForwardProto,
}

impl ForwardRule {
    /// Parse the listen endpoint
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen.parse().map_err(|_| {
            ConfigError::validation(format!(
                "forward listen '{}' must be an ip:port literal",
                self.listen
            ))
        })
    }

    /// Parse the target endpoint
    pub fn target_addr(&self) -> Result<Addr, ConfigError> {
        self.target
            .parse()
            .map_err(|e| ConfigError::validation(format!("forward target '{}': {e}", self.target)))
    }
}

/// Shared symmetric key
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EncryptionConfig {
    /// 32 bytes, hex encoded
    #[serde(default)]
    pub key: String,
}

impl EncryptionConfig {
    /// Decode the configured key
    pub fn key_bytes(&self) -> Result<[u8; 32], ConfigError> {
        let bytes = hex::decode(self.key.trim())
            .map_err(|_| ConfigError::validation("encryption.key is not valid hex"))?;
        bytes
            .try_into()
            .map_err(|_| ConfigError::validation("encryption.key must be exactly 32 bytes"))
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: debug, info, warn, error, fatal
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Apply role-dependent defaults that serde cannot express
    pub fn apply_defaults(&mut self) {
        if self.pcap.sockbuf == 0 {
            self.pcap.sockbuf = match self.role {
                Role::Server => 8 * 1024 * 1024,
                Role::Client => 4 * 1024 * 1024,
            };
        }
    }

    /// Validate the configuration, collecting every problem found
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` carrying all messages.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.transport.conn < 1 {
            errors.push("transport.conn must be >= 1".into());
        }

        if self.pcap.sockbuf < MIN_SOCKBUF {
            errors.push(format!(
                "pcap.sockbuf must be >= {MIN_SOCKBUF} bytes (got {})",
                self.pcap.sockbuf
            ));
        } else if self.pcap.sockbuf > MAX_SOCKBUF {
            warn!(
                "pcap.sockbuf {} exceeds maximum, clamping to {}",
                self.pcap.sockbuf, MAX_SOCKBUF
            );
            self.pcap.sockbuf = MAX_SOCKBUF;
        }
        if self.pcap.sockbuf >= MIN_SOCKBUF && !self.pcap.sockbuf.is_power_of_two() {
            warn!(
                "pcap.sockbuf ({} bytes) is not a power of 2; values like 4MB, 8MB or 16MB perform better",
                self.pcap.sockbuf
            );
        }

        let server_addr = match self.server.socket_addr() {
            Ok(sa) => Some(sa),
            Err(e) => {
                errors.push(e.to_string());
                None
            }
        };

        if let Some(sa) = server_addr {
            if self.role == Role::Client {
                // The synthesized outer headers need a source IP of the
                // server's family.
                let bound = match sa.ip() {
                    IpAddr::V4(_) => self.network.ipv4.addr.map(|a| a.is_ipv4()),
                    IpAddr::V6(_) => self.network.ipv6.addr.map(|a| a.is_ipv6()),
                };
                match bound {
                    Some(true) => {}
                    Some(false) => errors.push(
                        "network source binding family does not match server.addr".into(),
                    ),
                    None => errors.push(format!(
                        "client role requires a network.{}.addr source binding",
                        if sa.is_ipv4() { "ipv4" } else { "ipv6" }
                    )),
                }
            }
        }

        if self.kcp.pshard > 0 && self.kcp.dshard == 0 {
            errors.push("kcp.pshard requires kcp.dshard >= 1".into());
        }
        if !(576..=9000).contains(&self.kcp.mtu) {
            errors.push(format!("kcp.mtu {} out of range [576, 9000]", self.kcp.mtu));
        }
        if self.kcp.window < 16 {
            errors.push(format!("kcp.window {} too small (min 16)", self.kcp.window));
        }

        if self.mux.keepalive == 0 {
            errors.push("mux.keepalive must be >= 1 second".into());
        }
        if self.mux.max_streams == 0 {
            errors.push("mux.max_streams must be >= 1".into());
        }
        if !(1024..=65535).contains(&self.mux.frame_size) {
            errors.push(format!(
                "mux.frame_size {} out of range [1024, 65535]",
                self.mux.frame_size
            ));
        }

        if self.kcp.block != CipherKind::None {
            if let Err(e) = self.encryption.key_bytes() {
                errors.push(e.to_string());
            }
        }

        for rule in &self.forward {
            if let Err(e) = rule.listen_addr() {
                errors.push(e.to_string());
            }
            if let Err(e) = rule.target_addr() {
                errors.push(e.to_string());
            }
        }

        if !matches!(
            self.log.level.as_str(),
            "debug" | "info" | "warn" | "error" | "fatal"
        ) {
            errors.push(format!("log.level '{}' is not recognized", self.log.level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError(errors))
        }
    }
}

fn default_conn() -> usize {
    1
}
fn default_window() -> u32 {
    1024
}
fn default_mtu() -> u32 {
    1350
}
fn default_true() -> bool {
    true
}
fn default_interval() -> u32 {
    10
}
fn default_resend() -> u32 {
    2
}
fn default_keepalive() -> u64 {
    30
}
fn default_max_streams() -> usize {
    65535
}
fn default_frame_size() -> usize {
    32 * 1024
}
fn default_carrier() -> Carrier {
    Carrier::Tcp
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_client() -> Config {
        Config {
            role: Role::Client,
            transport: TransportConfig::default(),
            kcp: KcpSettings::default(),
            mux: MuxSettings::default(),
            pcap: PcapSettings::default(),
            network: NetworkConfig {
                ipv4: BindConfig {
                    addr: Some("192.168.1.10".parse().unwrap()),
                },
                ipv6: BindConfig::default(),
            },
            server: ServerSettings {
                addr: "203.0.113.1:4500".into(),
            },
            forward: vec![ForwardRule {
                listen: "127.0.0.1:7001".into(),
                target: "127.0.0.1:9001".into(),
                protocol: ForwardProto::Tcp,
            }],
            encryption: EncryptionConfig {
                key: "00".repeat(32),
            },
            log: LogConfig::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        let mut cfg = minimal_client();
        cfg.apply_defaults();
        cfg.validate().unwrap();
        assert_eq!(cfg.pcap.sockbuf, 4 * 1024 * 1024);
    }

    #[test]
    fn test_server_default_sockbuf() {
        let mut cfg = minimal_client();
        cfg.role = Role::Server;
        cfg.apply_defaults();
        assert_eq!(cfg.pcap.sockbuf, 8 * 1024 * 1024);
    }

    #[test]
    fn test_undersize_sockbuf_rejected() {
        let mut cfg = minimal_client();
        cfg.pcap.sockbuf = 512;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_oversize_sockbuf_clamped() {
        let mut cfg = minimal_client();
        cfg.pcap.sockbuf = 200 * 1024 * 1024;
        cfg.validate().unwrap();
        assert_eq!(cfg.pcap.sockbuf, MAX_SOCKBUF);
    }

    #[test]
    fn test_errors_collected_together() {
        let mut cfg = minimal_client();
        cfg.transport.conn = 0;
        cfg.encryption.key = "zz".into();
        cfg.log.level = "loud".into();
        cfg.apply_defaults();
        let msg = cfg.validate().unwrap_err().to_string();
        assert!(msg.contains("transport.conn"));
        assert!(msg.contains("encryption.key"));
        assert!(msg.contains("log.level"));
    }

    #[test]
    fn test_missing_source_binding_rejected() {
        let mut cfg = minimal_client();
        cfg.network.ipv4.addr = None;
        cfg.apply_defaults();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("network.ipv4.addr"));
    }

    #[test]
    fn test_pshard_without_dshard_rejected() {
        let mut cfg = minimal_client();
        cfg.kcp.pshard = 3;
        cfg.kcp.dshard = 0;
        cfg.apply_defaults();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_key_bytes_roundtrip() {
        let enc = EncryptionConfig {
            key: "0f".repeat(32),
        };
        assert_eq!(enc.key_bytes().unwrap(), [0x0f; 32]);
        let bad = EncryptionConfig { key: "0f".repeat(8) };
        assert!(bad.key_bytes().is_err());
    }
}
