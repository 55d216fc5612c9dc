pub mod models;

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::{
    config::Config,
    registry::SensorSource,
    sensors::{parse_sensors, Sensor},
};

use self::models::check_api_error;

/// Upper bound for a single REST request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// REST client for the gateway's sensor resources.
#[derive(Debug, Clone)]
pub struct DeconzClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http: Client,
    base_url: String,
    api_key: String,
}

impl DeconzClient {
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                http: Client::new(),
                base_url: config.deconz_url.clone(),
                api_key: config.deconz_api_key.clone(),
            }),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{}{}", self.inner.base_url, self.inner.api_key, path)
    }

    pub fn sensors_url(&self) -> String {
        self.url("/sensors")
    }

    async fn get_bytes(&self, url: &str, what: &str) -> Result<Vec<u8>> {
        let bytes = self
            .inner
            .http
            .get(url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("deCONZ {what} request failed"))?
            .error_for_status()
            .with_context(|| format!("deCONZ {what} endpoint returned error status"))?
            .bytes()
            .await
            .with_context(|| format!("Failed to read deCONZ {what} response body"))?;

        check_api_error(&bytes).with_context(|| format!("deCONZ {what} call failed"))?;
        Ok(bytes.to_vec())
    }

    /// Fetch every sensor known to the gateway, keyed by id.
    pub async fn get_sensors(&self) -> Result<HashMap<i64, Sensor>> {
        debug!(base_url = %self.inner.base_url, "Fetching sensors");
        let bytes = self.get_bytes(&self.sensors_url(), "sensors").await?;

        parse_sensors(&bytes).context("Failed to deserialize deCONZ sensors response")
    }
}

#[async_trait]
impl SensorSource for DeconzClient {
    async fn fetch_sensors(&self) -> Result<HashMap<i64, Sensor>> {
        self.get_sensors().await
    }
}
