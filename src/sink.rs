use std::{io::Write, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    events::SensorEvent,
    sensors::{DeriveError, TimeseriesPoint},
};

/// Destination of derived time-series points.
#[async_trait]
pub trait PointSink: Send + Sync {
    async fn write(&self, point: &TimeseriesPoint) -> anyhow::Result<()>;
}

/// Writes each point as one JSON object per line.
pub struct JsonLinesSink<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

#[async_trait]
impl<W: Write + Send> PointSink for JsonLinesSink<W> {
    async fn write(&self, point: &TimeseriesPoint) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(point).context("Failed to serialize time series point")?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line).context("Failed to write time series point")?;
        out.flush().context("Failed to flush time series sink")?;
        Ok(())
    }
}

/// Consumes the sensor event queue until every sender is gone, writing one
/// point per event. Returns the number of points written.
///
/// Points are stamped with the ingestion time.
pub async fn drain_events(mut rx: mpsc::Receiver<SensorEvent>, sink: Arc<dyn PointSink>) -> usize {
    info!("Sensor event drain started");
    let mut written = 0;

    while let Some(event) = rx.recv().await {
        if write_event(&event, sink.as_ref(), Utc::now()).await {
            written += 1;
        }
    }

    info!(written, "Sensor event queue closed; drain finished");
    written
}

/// Derives and writes the point for one event.
pub async fn write_event(event: &SensorEvent, sink: &dyn PointSink, now: DateTime<Utc>) -> bool {
    write_point(sink, event.resource_id(), event.timeseries(now)).await
}

/// Writes a derived point. Derivation and write failures are logged and
/// skipped; returns whether the point was written.
pub async fn write_point(
    sink: &dyn PointSink,
    sensor_id: i64,
    derived: Result<TimeseriesPoint, DeriveError>,
) -> bool {
    let point = match derived {
        Ok(point) => point,
        Err(e @ DeriveError::NoTimeseriesData { .. }) => {
            debug!(sensor_id, reason = %e, "Skipping point");
            return false;
        }
        Err(e) => {
            warn!(sensor_id, error = %e, "Skipping point");
            return false;
        }
    };

    match sink.write(&point).await {
        Ok(()) => true,
        Err(e) => {
            error!(sensor_id, error = %e, "Failed to write point");
            false
        }
    }
}
