//! routegated — health-gated BGP advertisement daemon.
//!
//! Single binary that assembles the subsystems:
//! - Config loader (JSON, validated)
//! - Host network setup (dummy link, address, optional IPVS entries)
//! - Embedded BGP speaker
//! - Health probe (HTTP endpoint or ICMP connectivity)
//! - Metrics server
//! - Advertisement control loop
//!
//! # Usage
//!
//! ```text
//! routegated --config /etc/routegate/config.json --ipvs-setup
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::info;

use routegate_bgp::Speaker;
use routegate_controller::Controller;
use routegate_health::HealthProbe;
use routegate_metrics::{AdvertisementGauge, PathLabels};

#[derive(Parser)]
#[command(name = "routegated", about = "Health-gated BGP advertisement daemon")]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "/etc/routegate/config.json")]
    config: PathBuf,

    /// Log level filter (also accepts tracing filter directives).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Set up the service link and address before starting.
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    network_setup: bool,

    /// Rebuild IPVS distribution entries for the service.
    #[arg(long)]
    ipvs_setup: bool,

    /// Address the metrics server listens on.
    #[arg(long, default_value = "0.0.0.0:8081")]
    metrics_address: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level {:?}", cli.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = routegate_config::Config::from_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let service = config.service.clone();
    let next_hop = config.next_hop();

    info!(
        service = %service.name,
        prefix = %service.ip,
        prefix_length = service.prefix_length,
        next_hop = %next_hop,
        "starting"
    );

    // Metric series exists (at 0) before the first health transition.
    let gauge = AdvertisementGauge::new();
    let labels = PathLabels::new(
        service.ip.to_string(),
        service.prefix_length.to_string(),
        next_hop.to_string(),
    );
    gauge.preset(&labels);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let speaker = Speaker::start(&config.bgp.local, gauge.clone(), events_tx)
        .await
        .context("starting BGP speaker")?;
    for peer in &config.bgp.peers {
        speaker
            .add_peer(peer)
            .with_context(|| format!("adding peer {}", peer.address))?;
    }

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            info!(peer = %event.peer, asn = event.asn, state = %event.state, "peer session state");
        }
    });

    // Sessions come up in the background; nothing is advertised until the
    // controller sees a healthy reading, so the host plumbing can follow.
    if cli.network_setup {
        routegate_net::configure(&service, next_hop, cli.ipvs_setup)
            .await
            .context("network setup failed")?;
    }

    let metrics_addr = cli.metrics_address;
    tokio::spawn(async move {
        if let Err(err) = routegate_metrics::serve(metrics_addr, gauge).await {
            tracing::error!(error = %err, "metrics server failed");
        }
    });

    let probe = HealthProbe::from_service(&service).context("building health probe")?;
    let controller = Controller::new(&service, next_hop);

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    controller
        .run(&probe, &speaker, shutdown_rx)
        .await
        .context("control loop failed")?;

    info!("stopped");
    Ok(())
}
