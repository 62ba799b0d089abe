//! Configuration module for phantom-proxy
//!
//! Configuration is loaded from a YAML file. Missing required keys are
//! fatal at startup; validation errors are collected and reported together.

mod loader;
mod types;

pub use loader::{load_config, load_config_str};
pub use types::{
    BindConfig, Config, EncryptionConfig, ForwardProto, ForwardRule, KcpSettings, LogConfig,
    MuxSettings, NetworkConfig, NodelayConfig, PcapSettings, Role, ServerSettings,
    TransportConfig, MAX_SOCKBUF, MIN_SOCKBUF,
};
