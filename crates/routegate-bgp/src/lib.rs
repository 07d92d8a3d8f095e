//! routegate-bgp — route advertisement for the service prefix.
//!
//! The controller consumes the narrow [`RouteAdvertiser`] contract:
//! advertise a path, withdraw it, list what is advertised. Behind it
//! sits [`Speaker`], a deliberately small embedded BGP-4 engine: one
//! session task per configured peer, OPEN/KEEPALIVE exchange, UPDATE
//! fan-out, hold-timer supervision, reconnect with backoff. The peer
//! set is fixed at startup and only IPv4 unicast paths are originated.
//!
//! Session state changes surface as [`PeerEvent`]s on a channel the
//! daemon drains for logging; they never drive advertisement decisions.

pub mod wire;

mod session;
mod speaker;

pub use speaker::Speaker;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from the speaker's setup phase and advertisement calls.
#[derive(Debug, Error)]
pub enum SpeakerError {
    #[error("invalid local identity: {0}")]
    InvalidIdentity(String),

    #[error("cannot listen for inbound sessions: {0}")]
    Listen(std::io::Error),

    #[error("peer {0} is already registered")]
    DuplicatePeer(IpAddr),

    #[error("path {0} is not advertised")]
    PathNotAdvertised(String),
}

/// Where a peer session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting out the reconnect backoff.
    Idle,
    /// Connecting / handshaking.
    Connect,
    Established,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connect => "connect",
            SessionState::Established => "established",
        };
        f.write_str(s)
    }
}

/// A peer session state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEvent {
    pub peer: IpAddr,
    pub asn: u32,
    pub state: SessionState,
}

/// Per-peer facts for one advertised path.
#[derive(Debug, Clone)]
pub struct PeerPathInfo {
    pub address: IpAddr,
    pub asn: u32,
    pub state: SessionState,
}

/// Diagnostic snapshot of one advertised path.
#[derive(Debug, Clone)]
pub struct PathInfo {
    pub prefix: Ipv4Addr,
    pub prefix_len: u8,
    pub next_hop: Ipv4Addr,
    /// Time since the path was installed.
    pub age: Duration,
    pub peers: Vec<PeerPathInfo>,
}

/// The advertisement contract the controller drives.
///
/// Implementations must make `advertise`/`withdraw` take effect for all
/// current and future peer sessions, and keep the advertisement metric
/// in step with the call outcome.
#[async_trait]
pub trait RouteAdvertiser: Send + Sync {
    /// Install the IPv4 unicast path `prefix/prefix_len` with
    /// origin=IGP and the given next hop; set the advertisement gauge
    /// to 1 on success.
    async fn advertise(
        &self,
        prefix: Ipv4Addr,
        prefix_len: u8,
        next_hop: Ipv4Addr,
    ) -> Result<(), SpeakerError>;

    /// Remove the same path; set the gauge to 0 on success.
    async fn withdraw(
        &self,
        prefix: Ipv4Addr,
        prefix_len: u8,
        next_hop: Ipv4Addr,
    ) -> Result<(), SpeakerError>;

    /// One-shot snapshot of the advertised paths, for diagnostic
    /// logging after transitions.
    async fn list_paths(&self) -> Vec<PathInfo>;
}
