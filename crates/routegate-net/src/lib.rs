//! routegate-net — one-shot host network setup for the service.
//!
//! Runs once before the control loop and makes the host consistent
//! with the declared service, so that traffic routed to the advertised
//! address actually reaches a live backend. Every step is idempotent:
//! a process restart re-runs the whole sequence without manual cleanup.
//!
//! 1. Optionally rebuild the IPVS distribution entries for the service
//!    address (cleanup-before-create; stale entries cannot be updated
//!    in place).
//! 2. Ensure a dummy link named after the service exists and is up.
//! 3. Flush all IPv4 addresses from that link, then bind the service
//!    address.
//!
//! Any failure is fatal to the caller: advertising a route for a
//! service that is not wired up locally is unsafe.

mod ipvs;
mod link;

pub use ipvs::IpvsAdm;

use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::info;

use routegate_config::ServiceConfig;

/// Fatal setup-phase failure.
#[derive(Debug, Error)]
pub enum NetSetupError {
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("cannot parse ipvs table: {0}")]
    Parse(String),
}

/// Apply the full network setup for `service`.
///
/// `backend` is the local address distribution entries point at (the
/// router ID). IPVS work runs only when `ipvs_setup` is set.
pub async fn configure(
    service: &ServiceConfig,
    backend: Ipv4Addr,
    ipvs_setup: bool,
) -> Result<(), NetSetupError> {
    if ipvs_setup {
        IpvsAdm::new().rebuild(service, backend).await?;
    }

    let (connection, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(connection);

    let index = link::ensure_service_device(&handle, &service.name).await?;
    link::ensure_device_up(&handle, index).await?;
    link::flush_ipv4_addresses(&handle, index).await?;
    link::add_address(&handle, index, service.ip, service.prefix_length).await?;

    info!(
        device = %service.name,
        address = %service.ip,
        prefix_length = service.prefix_length,
        "network setup complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use routegate_config::{PortMap, Protocol};

    fn service() -> ServiceConfig {
        ServiceConfig {
            name: "rg-test0".to_string(),
            ip: Ipv4Addr::new(10, 88, 2, 1),
            prefix_length: 32,
            protocol: Protocol::Tcp,
            ports: vec![PortMap {
                service_port: 443,
                target_port: 8443,
            }],
            http_health_check: None,
            ping_health_check: None,
        }
    }

    #[tokio::test]
    #[ignore = "needs root and a netlink-capable kernel"]
    async fn configure_is_idempotent() {
        let svc = service();
        let backend = Ipv4Addr::new(10, 88, 0, 200);

        configure(&svc, backend, false).await.unwrap();
        configure(&svc, backend, false).await.unwrap();

        // Exactly one IPv4 address must be bound after the second run.
        let (connection, handle, _) = rtnetlink::new_connection().unwrap();
        tokio::spawn(connection);
        let index = link::ensure_service_device(&handle, &svc.name).await.unwrap();
        let addrs = link::ipv4_addresses(&handle, index).await.unwrap();
        assert_eq!(addrs.len(), 1);
    }
}
