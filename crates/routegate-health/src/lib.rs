//! routegate-health — health probes for the advertised service.
//!
//! Two probe variants gate the route advertisement:
//! - [`EndpointProbe`]: one HTTP GET against the local backend.
//! - [`ConnectivityProbe`]: ICMP echo against an ordered target set,
//!   healthy if any target answers without loss.
//!
//! Variant selection happens once at startup from the service config;
//! the controller only sees [`HealthProbe::check`], which never fails —
//! anything that goes wrong during a check degrades the health signal
//! instead of propagating an error. Only construction-time
//! misconfiguration is a hard error.

pub mod connectivity;
pub mod endpoint;

pub use connectivity::ConnectivityProbe;
pub use endpoint::EndpointProbe;

use routegate_config::ServiceConfig;
use thiserror::Error;

/// Irrecoverable probe misconfiguration, surfaced before the control
/// loop starts.
#[derive(Debug, Error)]
pub enum ProbeSetupError {
    #[error("failed to build http probe client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("connectivity probe needs at least one target address")]
    NoTargets,
}

/// Result of one probe invocation.
///
/// Produced fresh on every check and consumed once by the controller;
/// only `healthy` outlives the tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub healthy: bool,
    /// Diagnostic error text; non-empty does not imply unhealthy.
    pub error: String,
    /// Human-readable detail, e.g. a response body or per-target
    /// packet-loss summary.
    pub output: String,
}

/// The probe variant the controller drives, fixed at startup.
pub enum HealthProbe {
    Endpoint(EndpointProbe),
    Connectivity(ConnectivityProbe),
}

impl HealthProbe {
    /// Build the probe the service config selects.
    ///
    /// With neither variant configured, falls back to the baseline
    /// connectivity probe against well-known public resolvers.
    pub fn from_service(service: &ServiceConfig) -> Result<HealthProbe, ProbeSetupError> {
        if let Some(http) = &service.http_health_check {
            return Ok(HealthProbe::Endpoint(EndpointProbe::new(http)?));
        }
        if let Some(ping) = &service.ping_health_check {
            return Ok(HealthProbe::Connectivity(ConnectivityProbe::new(
                ping.addresses.clone(),
            )?));
        }
        Ok(HealthProbe::Connectivity(ConnectivityProbe::baseline()))
    }

    /// Run one check. Blocks until the probe concludes.
    pub async fn check(&self) -> ProbeReport {
        match self {
            HealthProbe::Endpoint(probe) => probe.check().await,
            HealthProbe::Connectivity(probe) => probe.check().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routegate_config::{HttpHealthCheckConfig, PingHealthCheckConfig, Protocol};
    use std::net::Ipv4Addr;

    fn service() -> ServiceConfig {
        ServiceConfig {
            name: "svc".to_string(),
            ip: Ipv4Addr::new(10, 88, 2, 1),
            prefix_length: 32,
            protocol: Protocol::Tcp,
            ports: vec![],
            http_health_check: None,
            ping_health_check: None,
        }
    }

    #[test]
    fn selects_endpoint_variant() {
        let mut svc = service();
        svc.http_health_check = Some(HttpHealthCheckConfig {
            path: "healthz".to_string(),
            scheme: "http".to_string(),
            port: 8080,
            insecure_skip_verify: false,
        });

        let probe = HealthProbe::from_service(&svc).unwrap();
        assert!(matches!(probe, HealthProbe::Endpoint(_)));
    }

    #[test]
    fn selects_connectivity_variant() {
        let mut svc = service();
        svc.ping_health_check = Some(PingHealthCheckConfig {
            addresses: vec!["10.0.0.1".to_string()],
        });

        let probe = HealthProbe::from_service(&svc).unwrap();
        assert!(matches!(probe, HealthProbe::Connectivity(_)));
    }

    #[test]
    fn defaults_to_baseline_connectivity() {
        let probe = HealthProbe::from_service(&service()).unwrap();
        match probe {
            HealthProbe::Connectivity(c) => {
                assert_eq!(c.targets(), routegate_config::BASELINE_RESOLVERS);
            }
            HealthProbe::Endpoint(_) => panic!("expected connectivity probe"),
        }
    }

    #[test]
    fn empty_target_list_is_setup_error() {
        // Config validation rejects this too; the probe layer must not
        // rely on it.
        assert!(matches!(
            ConnectivityProbe::new(vec![]),
            Err(ProbeSetupError::NoTargets)
        ));
    }
}
