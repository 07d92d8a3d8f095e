//! ICMP connectivity probe.
//!
//! Sends one echo per target, in order, and declares the host healthy
//! as soon as any target answers with zero loss. A target that cannot
//! be probed at all (resolution or socket failure) contributes a
//! diagnostic to the report's `error` and is skipped; a target that is
//! reached but loses packets contributes a loss line to `output`.
//! Target order therefore bounds probe latency, never correctness.

use std::net::IpAddr;
use std::time::Duration;

use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence, SurgeError};

use routegate_config::BASELINE_RESOLVERS;

use crate::{ProbeReport, ProbeSetupError};

const ECHO_TIMEOUT: Duration = Duration::from_secs(5);
const ECHO_PAYLOAD: [u8; 56] = [0; 56];

/// What probing a single target produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// The echo ran; `loss_pct == 0` means the target is fully healthy.
    Stats { sent: u64, recv: u64, loss_pct: u64 },
    /// The probe never ran to completion for this target.
    Failed { stage: ProbeStage, error: String },
}

/// Where a per-target probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStage {
    /// Address resolution or socket setup.
    Create,
    /// The echo itself.
    Run,
}

impl ProbeStage {
    fn describe(&self) -> &'static str {
        match self {
            ProbeStage::Create => "failed to create probe",
            ProbeStage::Run => "failed to run probe",
        }
    }
}

/// Any-success ICMP probe over an ordered target set.
pub struct ConnectivityProbe {
    targets: Vec<String>,
}

impl ConnectivityProbe {
    /// Probe the given targets, in order. The list must be non-empty.
    pub fn new(targets: Vec<String>) -> Result<ConnectivityProbe, ProbeSetupError> {
        if targets.is_empty() {
            return Err(ProbeSetupError::NoTargets);
        }
        Ok(ConnectivityProbe { targets })
    }

    /// Baseline connectivity against well-known public resolvers.
    pub fn baseline() -> ConnectivityProbe {
        ConnectivityProbe {
            targets: BASELINE_RESOLVERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The configured target set, in probe order.
    pub fn targets(&self) -> Vec<String> {
        self.targets.clone()
    }

    /// Run one check over the real network.
    pub async fn check(&self) -> ProbeReport {
        self.check_with(ping_target).await
    }

    /// Run one check with an injected per-target probe function.
    ///
    /// The aggregation policy lives here; `check` supplies the real
    /// ICMP echo. Iteration stops at the first fully-healthy target, so
    /// no echo is sent to targets after a success.
    pub async fn check_with<F, Fut>(&self, probe: F) -> ProbeReport
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = TargetOutcome>,
    {
        let mut healthy = false;
        let mut error = String::new();
        let mut output = String::new();

        for target in &self.targets {
            match probe(target.clone()).await {
                TargetOutcome::Failed { stage, error: err } => {
                    error.push_str(&format!(
                        "{}: {} with error: {}, ",
                        target,
                        stage.describe(),
                        err
                    ));
                }
                TargetOutcome::Stats { loss_pct: 0, .. } => {
                    healthy = true;
                    break;
                }
                TargetOutcome::Stats {
                    sent,
                    recv,
                    loss_pct,
                } => {
                    output.push_str(&format!(
                        "{target}: {sent} packets transmitted, {recv} packets received, {loss_pct}% packet loss, "
                    ));
                }
            }
        }

        ProbeReport {
            healthy,
            error,
            output,
        }
    }
}

/// One ICMP echo against `target`, resolving host names first.
async fn ping_target(target: String) -> TargetOutcome {
    let addr = match resolve(&target).await {
        Ok(addr) => addr,
        Err(err) => {
            return TargetOutcome::Failed {
                stage: ProbeStage::Create,
                error: err,
            };
        }
    };

    let config = match addr {
        IpAddr::V4(_) => Config::default(),
        IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
    };
    let client = match Client::new(&config) {
        Ok(client) => client,
        Err(err) => {
            return TargetOutcome::Failed {
                stage: ProbeStage::Create,
                error: err.to_string(),
            };
        }
    };

    let mut pinger = client.pinger(addr, PingIdentifier(rand::random())).await;
    pinger.timeout(ECHO_TIMEOUT);

    match pinger.ping(PingSequence(0), &ECHO_PAYLOAD).await {
        Ok(_) => TargetOutcome::Stats {
            sent: 1,
            recv: 1,
            loss_pct: 0,
        },
        // A lost echo is a probe that ran: it counts as packet loss,
        // not as a probe failure.
        Err(SurgeError::Timeout { .. }) => TargetOutcome::Stats {
            sent: 1,
            recv: 0,
            loss_pct: 100,
        },
        Err(err) => TargetOutcome::Failed {
            stage: ProbeStage::Run,
            error: err.to_string(),
        },
    }
}

async fn resolve(target: &str) -> Result<IpAddr, String> {
    if let Ok(addr) = target.parse::<IpAddr>() {
        return Ok(addr);
    }
    let mut addrs = tokio::net::lookup_host((target, 0))
        .await
        .map_err(|e| e.to_string())?;
    addrs
        .next()
        .map(|sock| sock.ip())
        .ok_or_else(|| format!("no addresses resolved for {target}"))
}
