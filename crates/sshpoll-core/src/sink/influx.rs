//! InfluxDB 1.x HTTP write API.

use reqwest::blocking::Client;
use tracing::{trace, warn};

use super::{MetricsSink, SinkError};
use crate::config::InfluxConfig;
use crate::line_protocol;
use crate::record::DataPoint;

/// Posts line protocol to `/write`. One client (and connection pool) is shared
/// by all workers.
#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: Client,
    url: String,
    username: String,
    password: String,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, SinkError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SinkError::Transport(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.write_url(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl MetricsSink for InfluxSink {
    fn write(&self, points: &[DataPoint]) -> Result<(), SinkError> {
        let body = line_protocol::render_points(points, true);
        if body.is_empty() {
            if !points.is_empty() {
                warn!("Dropped {} points without fields", points.len());
            }
            return Ok(());
        }
        trace!("POST {} ({} bytes)", self.url, body.len());

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .body(body)
            .send()
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        Err(SinkError::Rejected {
            status: status.as_u16(),
            body: response.text().unwrap_or_default(),
        })
    }
}
