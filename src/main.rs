use std::sync::Arc;

use anyhow::Result;
use tokio::{
    signal,
    sync::{mpsc, watch},
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use deconz_ingest::{
    config::Config,
    deconz::DeconzClient,
    events::{LineEventReader, SensorEventReader},
    registry::{CachedSensorLookup, SensorCache, SensorSource},
    sensors::service::SensorService,
    sink::{drain_events, JsonLinesSink, PointSink},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (ignore error if file absent; env vars may be set externally)
    let _ = dotenvy::dotenv();

    // Logs go to stderr; stdout carries the points
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    let deconz = DeconzClient::new(&config);
    let cache = SensorCache::new();
    match deconz.fetch_sensors().await {
        Ok(sensors) => {
            info!(sensors = sensors.len(), "Sensor inventory loaded");
            cache.replace_all(sensors).await;
        }
        Err(e) => warn!(error = %e, "Initial sensor fetch failed; continuing with empty inventory"),
    }

    let sink: Arc<dyn PointSink> = Arc::new(JsonLinesSink::stdout());
    let (stop_tx, stop_rx) = watch::channel(false);

    // REST poller
    let poller = config.poll_interval().map(|interval| {
        let service = SensorService::new(deconz.clone(), cache.clone(), Arc::clone(&sink), interval);
        tokio::spawn(service.run(stop_rx.clone()))
    });
    if poller.is_none() {
        info!("POLL_INTERVAL_SECS is 0; REST polling disabled");
    }

    // Event stream
    let mut reader = None;
    let mut drain = None;
    if let Some(addr) = &config.event_stream_addr {
        let (tx, rx) = mpsc::channel(config.event_queue_capacity);
        drain = Some(tokio::spawn(drain_events(rx, Arc::clone(&sink))));

        let lookup = CachedSensorLookup::new(cache.clone(), deconz.clone());
        let mut events = SensorEventReader::new()
            .with_lookup(Arc::new(lookup))
            .with_reader(LineEventReader::new(addr.clone()))
            .with_backoff(config.redial_backoff());
        events.start(tx)?;
        info!(addr = %addr, "Reading sensor events");
        reader = Some(events);
    } else {
        info!("EVENT_STREAM_ADDR not set; event stream disabled");
    }

    shutdown_signal().await;

    stop_tx.send_replace(true);
    if let Some(mut events) = reader {
        // the stopped loop drops its queue sender, which ends the drain
        events.stop().await;
    }
    if let Some(task) = poller {
        if let Err(e) = task.await {
            error!(error = %e, "Sensor polling task failed");
        }
    }
    if let Some(task) = drain {
        match task.await {
            Ok(written) => info!(written, "Sensor event drain finished"),
            Err(e) => error!(error = %e, "Sensor event drain task failed"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
