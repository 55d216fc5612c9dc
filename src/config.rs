use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Gateway REST base URL, e.g. `http://192.168.1.10:80`.
    pub deconz_url: String,
    pub deconz_api_key: String,
    /// `host:port` of a newline-delimited JSON event stream.
    /// The event loop is not started when unset.
    pub event_stream_addr: Option<String>,
    /// Wait between failed dial attempts.
    pub redial_backoff_secs: u64,
    /// REST polling interval in seconds; `0` disables polling.
    pub poll_interval_secs: u64,
    /// Capacity of the sensor event queue between the event loop and the sink.
    pub event_queue_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            var(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("missing required env var: {key}"))
        };
        let optional = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_owned());

        let event_queue_capacity: usize = optional("EVENT_QUEUE_CAPACITY", "1024")
            .parse()
            .context("EVENT_QUEUE_CAPACITY must be a positive integer")?;
        if event_queue_capacity == 0 {
            bail!("EVENT_QUEUE_CAPACITY must be a positive integer");
        }

        Ok(Self {
            deconz_url: required("DECONZ_URL")?.trim_end_matches('/').to_owned(),
            deconz_api_key: required("DECONZ_API_KEY")?,
            event_stream_addr: var("EVENT_STREAM_ADDR")
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty()),
            redial_backoff_secs: optional("REDIAL_BACKOFF_SECS", "5")
                .parse()
                .context("REDIAL_BACKOFF_SECS must be a non-negative integer")?,
            poll_interval_secs: optional("POLL_INTERVAL_SECS", "60")
                .parse()
                .context("POLL_INTERVAL_SECS must be a non-negative integer")?,
            event_queue_capacity,
        })
    }

    pub fn redial_backoff(&self) -> Duration {
        Duration::from_secs(self.redial_backoff_secs)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }
}
