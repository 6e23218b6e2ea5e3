//! Router configuration.
//!
//! The configuration is a TOML file with a `[general]` table and one
//! `[[endpoint]]` table per configured link:
//!
//! ```toml
//! [general]
//! tcp_port = 5760
//! log = "/var/log/mavlink"
//! report_stats = true
//!
//! [[endpoint]]
//! type = "serial"
//! device = "/dev/ttyS1"
//! baud = 921600
//!
//! [[endpoint]]
//! type = "udp"
//! address = "0.0.0.0:14550"
//! mode = "server"
//!
//! [[endpoint]]
//! type = "tcp"
//! address = "10.0.0.2:5760"
//! retry_timeout = 5
//! ```

use crate::error::{Result, RouterError};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub endpoint: Vec<EndpointConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// Port to accept inbound TCP connections on, all interfaces.
    pub tcp_port: Option<u16>,
    /// Directory for ULog files; enables the log sink.
    pub log: Option<PathBuf>,
    /// Log per-endpoint statistics every second.
    #[serde(default)]
    pub report_stats: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum EndpointConfig {
    Serial {
        device: String,
        baud: u32,
    },
    Udp {
        address: String,
        #[serde(default = "default_udp_mode")]
        mode: UdpMode,
    },
    Tcp {
        address: String,
        /// Seconds between reconnection attempts; 0 disables them.
        #[serde(default)]
        retry_timeout: u64,
    },
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum UdpMode {
    /// Send to the configured address.
    Client,
    /// Bind the configured address and answer the last peer (eavesdropping).
    Server,
}

fn default_udp_mode() -> UdpMode {
    UdpMode::Client
}

impl EndpointConfig {
    /// Retry period of a TCP endpoint, zero for everything else.
    pub fn retry_timeout(&self) -> Duration {
        match self {
            EndpointConfig::Tcp { retry_timeout, .. } => Duration::from_secs(*retry_timeout),
            _ => Duration::ZERO,
        }
    }
}

impl Config {
    /// Reads, parses and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RouterError::filesystem(path.display().to_string(), e))?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| RouterError::config(format!("failed to parse config file: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        let mut ports = HashSet::new();

        if let Some(tcp_port) = self.general.tcp_port {
            ports.insert(tcp_port);
        }

        for (i, endpoint) in self.endpoint.iter().enumerate() {
            match endpoint {
                EndpointConfig::Udp { address, mode } => {
                    let addr = resolve(address, i)?;
                    // Only server mode binds the configured port locally.
                    if *mode == UdpMode::Server && addr.port() != 0 && !ports.insert(addr.port()) {
                        return Err(RouterError::config(format!(
                            "Duplicate port {} in endpoint {}",
                            addr.port(),
                            i
                        )));
                    }
                }
                EndpointConfig::Tcp {
                    address,
                    retry_timeout,
                } => {
                    // A retried endpoint may name a host that only resolves
                    // later; the retry timer resolves it on every attempt.
                    if *retry_timeout > 0 && has_port(address) {
                        if resolve(address, i).is_err() {
                            tracing::warn!(
                                "TCP address {} does not resolve yet (endpoint {})",
                                address,
                                i
                            );
                        }
                    } else {
                        resolve(address, i)?;
                    }
                }
                EndpointConfig::Serial { device, baud } => {
                    if *baud == 0 {
                        return Err(RouterError::config(format!(
                            "Invalid baud rate 0 for {device} (endpoint {i})"
                        )));
                    }
                    if !Path::new(device).exists() {
                        tracing::warn!("Serial device {} does not exist (endpoint {})", device, i);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Whether `address` has the `host:port` shape.
fn has_port(address: &str) -> bool {
    address
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}

fn resolve(address: &str, index: usize) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| {
            RouterError::config(format!(
                "Invalid address '{address}' in endpoint {index}"
            ))
        })
}
