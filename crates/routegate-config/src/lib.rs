//! routegate configuration document.
//!
//! The daemon reads a single JSON document describing the local BGP
//! identity, the peer set, and the service whose address is advertised.
//! The document is parsed once at startup and is immutable for the
//! process lifetime.
//!
//! ```json
//! {
//!   "bgp": {
//!     "local": { "routerId": "10.88.0.200", "asn": 65512, "listenPort": -1 },
//!     "peers": [ { "address": "10.88.0.253", "asn": 65512 } ]
//!   },
//!   "service": {
//!     "name": "matchbox",
//!     "ip": "10.88.2.1",
//!     "ports": [ { "servicePort": 443, "targetPort": 8443 } ],
//!     "httpHealthCheck": { "path": "healthz", "port": 8443 }
//!   }
//! }
//! ```
//!
//! Exactly zero or one of `httpHealthCheck` / `pingHealthCheck` may be
//! present; with neither, the daemon falls back to a baseline
//! connectivity probe against well-known public resolvers.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default ping targets when no health check is configured.
pub const BASELINE_RESOLVERS: [&str; 3] = ["1.1.1.1", "8.8.8.8", "9.9.9.9"];

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bgp: BgpConfig,
    pub service: ServiceConfig,
}

/// BGP section: local speaker identity plus the peer set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BgpConfig {
    pub local: LocalConfig,
    pub peers: Vec<PeerConfig>,
}

/// Identity of the local BGP speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    /// Router ID, an IPv4 address in text form. Doubles as the next-hop
    /// for advertised paths.
    pub router_id: String,
    pub asn: u32,
    /// TCP port for inbound sessions; zero or negative disables the
    /// passive listener.
    pub listen_port: i32,
}

/// A single BGP neighbor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Session endpoint. May be IPv6 even though only IPv4 prefixes are
    /// ever advertised.
    pub address: IpAddr,
    pub asn: u32,
}

/// Transport protocol for the load-distribution entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Tcp
    }
}

impl Protocol {
    /// Name as understood by the kernel tooling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
        }
    }
}

/// One service-port to target-port mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMap {
    pub service_port: u16,
    pub target_port: u16,
}

fn default_prefix_length() -> u8 {
    32
}

/// The advertised service: its address, ports, and health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Service name; also names the dummy link device.
    pub name: String,
    /// The virtual service address advertised into the fabric.
    pub ip: Ipv4Addr,
    #[serde(default = "default_prefix_length")]
    pub prefix_length: u8,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub ports: Vec<PortMap>,
    #[serde(default)]
    pub http_health_check: Option<HttpHealthCheckConfig>,
    #[serde(default)]
    pub ping_health_check: Option<PingHealthCheckConfig>,
}

fn default_scheme() -> String {
    "http".to_string()
}

/// HTTP endpoint health check against the local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpHealthCheckConfig {
    pub path: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub port: u16,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// ICMP connectivity health check against an ordered target set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingHealthCheckConfig {
    pub addresses: Vec<String>,
}

impl Config {
    /// Read and parse the configuration document from `path`.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints the type system cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bgp.local.router_id.parse::<Ipv4Addr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "bgp.local.routerId {:?} is not an IPv4 address",
                self.bgp.local.router_id
            )));
        }
        if self.bgp.peers.is_empty() {
            return Err(ConfigError::Invalid(
                "bgp.peers must list at least one peer".to_string(),
            ));
        }
        if self.service.prefix_length == 0 || self.service.prefix_length > 32 {
            return Err(ConfigError::Invalid(format!(
                "service.prefixLength {} is outside 1..=32",
                self.service.prefix_length
            )));
        }
        if self.service.http_health_check.is_some() && self.service.ping_health_check.is_some() {
            return Err(ConfigError::Invalid(
                "service.httpHealthCheck and service.pingHealthCheck are mutually exclusive"
                    .to_string(),
            ));
        }
        if let Some(ping) = &self.service.ping_health_check {
            if ping.addresses.is_empty() {
                return Err(ConfigError::Invalid(
                    "service.pingHealthCheck.addresses must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The next-hop address advertised for the service prefix.
    ///
    /// Only valid after `validate`, which pins the router ID to IPv4.
    pub fn next_hop(&self) -> Ipv4Addr {
        self.bgp
            .local
            .router_id
            .parse()
            .expect("router_id validated as IPv4")
    }
}
