//! HTTP JSON event sink.

use std::time::Duration;

use crate::domain::SinkPayload;
use crate::error::{Error, Result};
use crate::ports::EventSink;

/// Default bound for one forwarding request.
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(2);

/// Posts lifecycle events as JSON to a collector endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    /// Create a sink for `url`; every request is bounded by `timeout`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl EventSink for HttpSink {
    async fn forward(&self, payload: &SinkPayload<'_>) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::SinkUnreachable(format!("{}: {}", self.url, e)))?;

        response
            .error_for_status()
            .map(|_| ())
            .map_err(|e| Error::SinkUnreachable(format!("{}: {}", self.url, e)))
    }
}
