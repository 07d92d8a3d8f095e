//! routegate metrics — advertisement state for scraping.
//!
//! A single gauge, `bgp_lb_path_advertisement{prefix, prefix_length,
//! next_hop}`, reports whether a path is currently advertised (1) or
//! withdrawn (0). The gauge is preset to 0 at startup so the first
//! scrape after a restart never reports a stale advertisement.
//!
//! Exposition is the plain Prometheus text format, rendered by hand and
//! served from a dedicated axum listener on `/metrics`. The speaker is
//! the only writer; the scrape handler only reads.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::info;

/// Label set for one advertised path series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathLabels {
    pub prefix: String,
    pub prefix_length: String,
    pub next_hop: String,
}

impl PathLabels {
    pub fn new(prefix: impl Into<String>, prefix_length: impl Into<String>, next_hop: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            prefix_length: prefix_length.into(),
            next_hop: next_hop.into(),
        }
    }
}

/// The `bgp_lb_path_advertisement` gauge.
///
/// Cheap to clone; clones share the underlying series map.
#[derive(Clone, Default)]
pub struct AdvertisementGauge {
    series: Arc<Mutex<BTreeMap<PathLabels, u8>>>,
}

impl AdvertisementGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the labeled path as advertised.
    pub fn set(&self, labels: &PathLabels) {
        self.series.lock().unwrap().insert(labels.clone(), 1);
    }

    /// Mark the labeled path as withdrawn.
    pub fn unset(&self, labels: &PathLabels) {
        self.series.lock().unwrap().insert(labels.clone(), 0);
    }

    /// Pin the series to 0 so it exists before the first transition.
    pub fn preset(&self, labels: &PathLabels) {
        self.unset(labels);
    }

    /// Current value for the labeled path, if the series exists.
    pub fn get(&self, labels: &PathLabels) -> Option<u8> {
        self.series.lock().unwrap().get(labels).copied()
    }

    /// Render all series in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        out.push_str(
            "# HELP bgp_lb_path_advertisement Whether a path is advertised via the bgp daemon. It can be 0 or 1.\n",
        );
        out.push_str("# TYPE bgp_lb_path_advertisement gauge\n");
        for (labels, value) in self.series.lock().unwrap().iter() {
            out.push_str(&format!(
                "bgp_lb_path_advertisement{{prefix=\"{}\",prefix_length=\"{}\",next_hop=\"{}\"}} {}\n",
                labels.prefix, labels.prefix_length, labels.next_hop, value
            ));
        }
        out
    }
}

/// Build the scrape router.
pub fn metrics_router(gauge: AdvertisementGauge) -> axum::Router {
    use axum::routing::get;

    axum::Router::new().route(
        "/metrics",
        get(move || {
            let gauge = gauge.clone();
            async move { gauge.render_prometheus() }
        }),
    )
}

/// Bind and serve the scrape endpoint until the process exits.
pub async fn serve(addr: SocketAddr, gauge: AdvertisementGauge) -> std::io::Result<()> {
    let router = metrics_router(gauge);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> PathLabels {
        PathLabels::new("10.88.2.1", "32", "10.88.0.200")
    }

    #[test]
    fn preset_pins_series_to_zero() {
        let gauge = AdvertisementGauge::new();
        gauge.preset(&labels());

        assert_eq!(gauge.get(&labels()), Some(0));
        let text = gauge.render_prometheus();
        assert!(text.contains(
            "bgp_lb_path_advertisement{prefix=\"10.88.2.1\",prefix_length=\"32\",next_hop=\"10.88.0.200\"} 0"
        ));
    }

    #[test]
    fn set_and_unset_flip_value() {
        let gauge = AdvertisementGauge::new();
        gauge.preset(&labels());

        gauge.set(&labels());
        assert_eq!(gauge.get(&labels()), Some(1));

        gauge.unset(&labels());
        assert_eq!(gauge.get(&labels()), Some(0));
    }

    #[test]
    fn render_includes_help_and_type() {
        let gauge = AdvertisementGauge::new();
        let text = gauge.render_prometheus();

        assert!(text.starts_with("# HELP bgp_lb_path_advertisement"));
        assert!(text.contains("# TYPE bgp_lb_path_advertisement gauge"));
    }

    #[test]
    fn clones_share_series() {
        let gauge = AdvertisementGauge::new();
        let other = gauge.clone();

        gauge.set(&labels());
        assert_eq!(other.get(&labels()), Some(1));
    }

    #[tokio::test]
    async fn serve_surfaces_bind_failure_as_io_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let err = serve(addr, AdvertisementGauge::new()).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn scrape_endpoint_serves_text() {
        let gauge = AdvertisementGauge::new();
        gauge.preset(&labels());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = metrics_router(gauge);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let body = reqwest::get(format!("http://{addr}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("bgp_lb_path_advertisement"));
    }
}
