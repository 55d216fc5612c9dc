use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::{sync::watch, time};
use tracing::{error, info};

use crate::{
    events::reader::stop_requested,
    registry::{SensorCache, SensorSource},
    sink::{write_point, PointSink},
};

/// Periodically pulls the sensor inventory over REST, refreshes the shared
/// cache and writes each sensor's current state as a point.
pub struct SensorService<S> {
    source: S,
    cache: SensorCache,
    sink: Arc<dyn PointSink>,
    interval: Duration,
}

impl<S: SensorSource> SensorService<S> {
    pub fn new(source: S, cache: SensorCache, sink: Arc<dyn PointSink>, interval: Duration) -> Self {
        Self {
            source,
            cache,
            sink,
            interval,
        }
    }

    /// One poll. Returns the number of points written.
    pub async fn poll_once(&self) -> Result<usize> {
        let sensors = self
            .source
            .fetch_sensors()
            .await
            .context("Failed to fetch sensor inventory")?;
        info!(sensors = sensors.len(), "Sensor inventory refreshed");
        self.cache.replace_all(sensors).await;

        let now = Utc::now();
        let mut written = 0;
        for sensor in self.cache.all().await {
            if write_point(self.sink.as_ref(), sensor.id, sensor.timeseries(now)).await {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Polls every `interval` until `stop` flips to `true`.
    /// Spawn this via `tokio::spawn`.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Sensor polling loop started");
        let mut ticker = time::interval(self.interval);

        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break,
                _ = ticker.tick() => {}
            }
            match self.poll_once().await {
                Ok(written) => info!(written, "Sensor poll complete"),
                Err(e) => error!(error = %e, "Sensor poll failed"),
            }
        }

        info!("Sensor polling loop stopped");
    }
}
