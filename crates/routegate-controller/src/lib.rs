//! routegate-controller — the advertisement control loop.
//!
//! Owns the single authoritative `advertised` flag and drives it from
//! the health signal: advertise on the false→true edge, withdraw on
//! the true→false edge, do nothing on steady readings. Each transition
//! performs exactly one advertiser call followed by one diagnostic path
//! listing. Probe errors are warnings, never state changes; an
//! advertiser failure during a transition aborts the loop and the
//! process with it — a supervisor restart rebuilds from `Withdrawn`
//! with the metric preset to 0, which is cheaper and safer than
//! in-process reconciliation.
//!
//! The loop runs a fixed 1 s cadence and awaits each check to
//! completion before scheduling the next tick, so ticks never overlap
//! no matter how slow a probe is.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use routegate_bgp::{RouteAdvertiser, SpeakerError};
use routegate_config::ServiceConfig;
use routegate_health::{HealthProbe, ProbeReport};

/// Default control loop cadence.
pub const TICK: Duration = Duration::from_secs(1);

/// The health source the controller polls each tick.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> ProbeReport;
}

#[async_trait]
impl Probe for HealthProbe {
    async fn check(&self) -> ProbeReport {
        HealthProbe::check(self).await
    }
}

/// An edge of the health signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advertise,
    Withdraw,
}

/// The advertised/withdrawn flag, owned exclusively by the controller.
///
/// Reset to withdrawn on every process start; flips only through
/// `commit`, after the corresponding advertiser call succeeded.
#[derive(Debug, Default)]
pub struct AdvertisementState {
    advertised: bool,
}

impl AdvertisementState {
    pub fn new() -> AdvertisementState {
        AdvertisementState { advertised: false }
    }

    pub fn advertised(&self) -> bool {
        self.advertised
    }

    /// The transition this health reading demands, if any.
    pub fn evaluate(&self, healthy: bool) -> Option<Transition> {
        match (healthy, self.advertised) {
            (true, false) => Some(Transition::Advertise),
            (false, true) => Some(Transition::Withdraw),
            _ => None,
        }
    }

    /// Record a completed transition.
    pub fn commit(&mut self, transition: Transition) {
        self.advertised = matches!(transition, Transition::Advertise);
    }
}

/// Drives the advertisement of one service path from its health signal.
pub struct Controller {
    state: AdvertisementState,
    prefix: Ipv4Addr,
    prefix_len: u8,
    next_hop: Ipv4Addr,
    tick: Duration,
}

impl Controller {
    pub fn new(service: &ServiceConfig, next_hop: Ipv4Addr) -> Controller {
        Controller {
            state: AdvertisementState::new(),
            prefix: service.ip,
            prefix_len: service.prefix_length,
            next_hop,
            tick: TICK,
        }
    }

    /// Override the cadence (tests run fast ticks).
    pub fn with_tick(mut self, tick: Duration) -> Controller {
        self.tick = tick;
        self
    }

    pub fn advertised(&self) -> bool {
        self.state.advertised()
    }

    /// Process one health reading.
    ///
    /// At most one advertiser call, on an edge of the signal; the flag
    /// flips only after that call succeeds.
    pub async fn observe<A: RouteAdvertiser + ?Sized>(
        &mut self,
        report: &ProbeReport,
        advertiser: &A,
    ) -> Result<(), SpeakerError> {
        if !report.error.is_empty() {
            warn!(error = %report.error, "health check error");
        }
        if report.healthy {
            debug!("health check succeeded");
        } else if !report.output.is_empty() {
            warn!(detail = %report.output, "health check failed");
        } else {
            warn!("health check failed");
        }

        let Some(transition) = self.state.evaluate(report.healthy) else {
            return Ok(());
        };

        match transition {
            Transition::Advertise => {
                advertiser
                    .advertise(self.prefix, self.prefix_len, self.next_hop)
                    .await?;
            }
            Transition::Withdraw => {
                advertiser
                    .withdraw(self.prefix, self.prefix_len, self.next_hop)
                    .await?;
            }
        }
        self.state.commit(transition);

        for path in advertiser.list_paths().await {
            info!(
                prefix = %path.prefix,
                prefix_length = path.prefix_len,
                next_hop = %path.next_hop,
                age_secs = path.age.as_secs(),
                "advertised path"
            );
            for peer in &path.peers {
                info!(peer = %peer.address, peer_asn = peer.asn, state = %peer.state, "peer");
            }
        }
        match transition {
            Transition::Advertise => info!("service on"),
            Transition::Withdraw => info!("service off"),
        }
        Ok(())
    }

    /// Run the control loop until shutdown or a fatal advertiser error.
    ///
    /// On shutdown, withdraws the path if it is currently advertised so
    /// peers stop routing here before the process exits.
    pub async fn run<P, A>(
        mut self,
        probe: &P,
        advertiser: &A,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SpeakerError>
    where
        P: Probe,
        A: RouteAdvertiser + ?Sized,
    {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("running a new health check");
                    let report = probe.check().await;
                    self.observe(&report, advertiser).await?;
                }
                _ = shutdown.changed() => {
                    if self.state.advertised() {
                        info!("withdrawing path before shutdown");
                        advertiser
                            .withdraw(self.prefix, self.prefix_len, self.next_hop)
                            .await?;
                        self.state.commit(Transition::Withdraw);
                    }
                    info!("controller stopped");
                    return Ok(());
                }
            }
        }
    }
}
