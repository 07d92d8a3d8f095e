//! HTTP endpoint probe.
//!
//! Issues one GET against the backend on loopback and gates health on
//! a 2xx status. The response body is always drained so the client can
//! reuse the connection, and is surfaced as the report's `output`.

use std::time::Duration;

use tracing::warn;

use routegate_config::HttpHealthCheckConfig;

use crate::{ProbeReport, ProbeSetupError};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Probes `{scheme}://127.0.0.1:{port}/{path}`.
pub struct EndpointProbe {
    client: reqwest::Client,
    url: String,
}

impl EndpointProbe {
    /// Build the probe and its HTTP client.
    ///
    /// `insecure_skip_verify` disables certificate verification for
    /// https schemes, for backends serving self-signed certificates on
    /// loopback.
    pub fn new(config: &HttpHealthCheckConfig) -> Result<EndpointProbe, ProbeSetupError> {
        let scheme = if config.scheme.is_empty() {
            "http"
        } else {
            &config.scheme
        };
        let url = format!("{}://127.0.0.1:{}/{}", scheme, config.port, config.path);

        let mut builder = reqwest::Client::builder().timeout(CLIENT_TIMEOUT);
        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        Ok(EndpointProbe { client, url })
    }

    /// Run one GET against the endpoint.
    pub async fn check(&self) -> ProbeReport {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, url = %self.url, "error while trying to query HTTP endpoint");
                return ProbeReport {
                    healthy: false,
                    error: err.to_string(),
                    output: String::new(),
                };
            }
        };

        let status = response.status();
        // Draining the body keeps the connection reusable.
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, url = %self.url, "failed to read endpoint response body");
                return ProbeReport {
                    healthy: false,
                    error: err.to_string(),
                    output: String::new(),
                };
            }
        };

        let healthy = status.as_u16() >= 200 && status.as_u16() < 300;
        if !healthy {
            warn!(code = status.as_u16(), url = %self.url, "invalid response from endpoint");
        }
        ProbeReport {
            healthy,
            error: String::new(),
            output: body,
        }
    }
}
