//! Configuration loading
//!
//! Reads the YAML file named on the command line, applies role-dependent
//! defaults, and validates. `PHANTOM_LOG_LEVEL` overrides `log.level`.

use std::path::Path;

use tracing::debug;

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a YAML file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    load_config_str(&contents)
}

/// Load configuration from a YAML string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let mut config: Config =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    if let Ok(level) = std::env::var("PHANTOM_LOG_LEVEL") {
        debug!("Log level overridden to {} by PHANTOM_LOG_LEVEL", level);
        config.log.level = level;
    }

    config.apply_defaults();
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CLIENT_YAML: &str = r#"
role: client
transport:
  conn: 3
network:
  ipv4:
    addr: 192.168.1.10
server:
  addr: 203.0.113.1:4500
forward:
  - listen: 127.0.0.1:7001
    target: 127.0.0.1:9001
    protocol: tcp
  - listen: 127.0.0.1:7002
    target: 127.0.0.1:9002
    protocol: udp
encryption:
  key: "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
log:
  level: debug
"#;

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(CLIENT_YAML.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.transport.conn, 3);
        assert_eq!(config.forward.len(), 2);
        assert_eq!(config.pcap.sockbuf, 4 * 1024 * 1024);
    }

    #[test]
    fn test_missing_file() {
        let err = load_config("/nonexistent/config.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_missing_required_key_is_fatal() {
        // No `server` section.
        let yaml = "role: server\n";
        assert!(matches!(
            load_config_str(yaml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_server_minimal() {
        let yaml = r#"
role: server
server:
  addr: 0.0.0.0:4500
encryption:
  key: "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
"#;
        let config = load_config_str(yaml).unwrap();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.pcap.sockbuf, 8 * 1024 * 1024);
        assert_eq!(config.kcp.window, 1024);
        assert_eq!(config.mux.keepalive, 30);
    }

    #[test]
    fn test_invalid_yaml_reported() {
        assert!(matches!(
            load_config_str("role: [broken"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
