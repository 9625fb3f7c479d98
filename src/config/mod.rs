//! Configuration: YAML file plus CLI overrides

use crate::{PoolError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_web_port() -> u16 {
    8080
}

fn default_proxy_file() -> PathBuf {
    PathBuf::from("proxies.txt")
}

fn default_max_active_proxies() -> usize {
    100
}

fn default_port_base() -> u16 {
    10000
}

fn default_port_count() -> u16 {
    100
}

/// Top-level configuration for the pool engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address for both the local listener ports and the control surface.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port the control surface (`/acquire`, `/stats`) listens on.
    #[serde(rename = "web-port", default = "default_web_port")]
    pub web_port: u16,

    /// Path to the remote proxy credential file.
    #[serde(rename = "proxy-file", default = "default_proxy_file")]
    pub proxy_file: PathBuf,

    /// Upper bound on how many remotes are kept bound concurrently at warmup.
    #[serde(rename = "max-active-proxies", default = "default_max_active_proxies")]
    pub max_active_proxies: usize,

    /// First local listener port.
    #[serde(rename = "port-base", default = "default_port_base")]
    pub port_base: u16,

    /// Number of contiguous local listener ports.
    #[serde(rename = "port-count", default = "default_port_count")]
    pub port_count: u16,

    /// Log level passed to the `tracing` `EnvFilter` when `RUST_LOG` is unset.
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: default_host(),
            web_port: default_web_port(),
            proxy_file: default_proxy_file(),
            max_active_proxies: default_max_active_proxies(),
            port_base: default_port_base(),
            port_count: default_port_count(),
            log_level: Some("info".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file. A missing file is not an error — defaults apply.
    pub fn load(path: &str) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(PoolError::config_fatal(format!(
                "failed to read config file {}: {}",
                path, e
            ))),
        }
    }

    /// Parse configuration from a YAML string.
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints not expressible via serde defaults.
    pub fn validate(&self) -> Result<()> {
        if self.port_count == 0 {
            return Err(PoolError::config_fatal("port-count must be greater than zero"));
        }
        if (self.port_base as u32) + (self.port_count as u32) > u16::MAX as u32 + 1 {
            return Err(PoolError::config_fatal(
                "port-base + port-count overflows the u16 port range",
            ));
        }
        Ok(())
    }

    pub fn proxy_file_path(&self) -> &Path {
        &self.proxy_file
    }
}
