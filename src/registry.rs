use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    sync::{Mutex, RwLock},
    time::{self, Instant},
};
use tracing::{debug, info};

use crate::sensors::Sensor;

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("sensor {0} not found")]
    NotFound(i64),

    #[error("refreshing sensors failed: {0:#}")]
    Refresh(anyhow::Error),

    #[error("refreshing sensors timed out after {0:?}")]
    Timeout(Duration),
}

pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Answers "which sensor has id N".
#[async_trait]
pub trait SensorLookup: Send + Sync {
    async fn lookup_sensor(&self, id: i64) -> Result<Sensor, LookupError>;
}

/// Supplies the full sensor inventory, e.g. from the gateway REST API.
#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn fetch_sensors(&self) -> anyhow::Result<HashMap<i64, Sensor>>;
}

/// In-memory store of the known sensors, keyed by id.
///
/// Wrapped in `Arc` so it can be cheaply cloned and shared across tasks.
/// Uses `tokio::sync::RwLock` so concurrent lookups never block each other.
#[derive(Clone, Default)]
pub struct SensorCache {
    inner: Arc<RwLock<HashMap<i64, Sensor>>>,
}

impl SensorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole inventory with `sensors`.
    pub async fn replace_all(&self, sensors: HashMap<i64, Sensor>) {
        *self.inner.write().await = sensors;
    }

    /// Insert or overwrite a single sensor.
    pub async fn update(&self, sensor: Sensor) {
        self.inner.write().await.insert(sensor.id, sensor);
    }

    pub async fn get(&self, id: i64) -> Option<Sensor> {
        self.inner.read().await.get(&id).cloned()
    }

    /// Snapshot of all sensors, ordered by id.
    pub async fn all(&self) -> Vec<Sensor> {
        let mut sensors: Vec<Sensor> = self.inner.read().await.values().cloned().collect();
        sensors.sort_by_key(|s| s.id);
        sensors
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[async_trait]
impl SensorLookup for SensorCache {
    async fn lookup_sensor(&self, id: i64) -> Result<Sensor, LookupError> {
        self.get(id).await.ok_or(LookupError::NotFound(id))
    }
}

/// Cache-first lookup that refreshes the cache from `source` on a miss.
///
/// Covers sensors paired after the last inventory refresh. Refreshes run one
/// at a time, are bounded by `refresh_timeout` and happen at most once per
/// `min_refresh_interval`; misses in between report `NotFound` directly.
pub struct CachedSensorLookup<S> {
    cache: SensorCache,
    source: S,
    refresh_timeout: Duration,
    min_refresh_interval: Duration,
    last_refresh: Mutex<Option<Instant>>,
}

impl<S: SensorSource> CachedSensorLookup<S> {
    pub fn new(cache: SensorCache, source: S) -> Self {
        Self {
            cache,
            source,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            last_refresh: Mutex::new(None),
        }
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    pub fn cache(&self) -> &SensorCache {
        &self.cache
    }
}

#[async_trait]
impl<S: SensorSource> SensorLookup for CachedSensorLookup<S> {
    async fn lookup_sensor(&self, id: i64) -> Result<Sensor, LookupError> {
        if let Some(sensor) = self.cache.get(id).await {
            return Ok(sensor);
        }

        let mut last_refresh = self.last_refresh.lock().await;
        // a refresh may have completed while waiting for the lock
        if let Some(sensor) = self.cache.get(id).await {
            return Ok(sensor);
        }
        if last_refresh.is_some_and(|at| at.elapsed() < self.min_refresh_interval) {
            debug!(sensor_id = id, "Sensor not cached; inventory refreshed recently");
            return Err(LookupError::NotFound(id));
        }
        *last_refresh = Some(Instant::now());

        debug!(sensor_id = id, "Sensor not cached; refreshing inventory");
        let sensors = time::timeout(self.refresh_timeout, self.source.fetch_sensors())
            .await
            .map_err(|_| LookupError::Timeout(self.refresh_timeout))?
            .map_err(LookupError::Refresh)?;
        info!(sensors = sensors.len(), "Sensor inventory refreshed");
        self.cache.replace_all(sensors).await;

        self.cache.get(id).await.ok_or(LookupError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::sensors::{SensorConfig, SensorState};

    fn make_sensor(id: i64, name: &str) -> Sensor {
        Sensor {
            id,
            sensor_type: "ZHATemperature".to_owned(),
            name: name.to_owned(),
            last_seen: None,
            config: SensorConfig::default(),
            state: SensorState::Empty,
        }
    }

    struct FakeSource {
        sensors: Vec<Sensor>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SensorSource for FakeSource {
        async fn fetch_sensors(&self) -> anyhow::Result<HashMap<i64, Sensor>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.sensors.iter().map(|s| (s.id, s.clone())).collect())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl SensorSource for FailingSource {
        async fn fetch_sensors(&self) -> anyhow::Result<HashMap<i64, Sensor>> {
            anyhow::bail!("gateway unreachable")
        }
    }

    #[tokio::test]
    async fn empty_cache_returns_nothing() {
        let cache = SensorCache::new();
        assert!(cache.all().await.is_empty());
        assert!(cache.get(1).await.is_none());
        assert!(matches!(cache.lookup_sensor(1).await, Err(LookupError::NotFound(1))));
    }

    #[tokio::test]
    async fn update_overwrites_previous_sensor() {
        let cache = SensorCache::new();
        cache.update(make_sensor(1, "old")).await;
        cache.update(make_sensor(1, "new")).await;

        assert_eq!(cache.lookup_sensor(1).await.unwrap().name, "new");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn replace_all_drops_unknown_sensors() {
        let cache = SensorCache::new();
        cache.update(make_sensor(1, "a")).await;
        cache
            .replace_all(HashMap::from([(2, make_sensor(2, "b")), (3, make_sensor(3, "c"))]))
            .await;

        let ids: Vec<i64> = cache.all().await.iter().map(|s| s.id).collect();
        assert_eq!(ids, [2, 3]);
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let cache = SensorCache::new();
        let clone = cache.clone();
        cache.update(make_sensor(5, "shared")).await;
        assert_eq!(clone.get(5).await.unwrap().name, "shared");
    }

    #[tokio::test]
    async fn cached_lookup_hits_without_refresh() {
        let cache = SensorCache::new();
        cache.update(make_sensor(1, "cached")).await;
        let source = FakeSource { sensors: vec![], calls: AtomicUsize::new(0) };
        let lookup = CachedSensorLookup::new(cache, source);

        assert_eq!(lookup.lookup_sensor(1).await.unwrap().name, "cached");
        assert_eq!(lookup.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cached_lookup_refreshes_on_miss() {
        let source = FakeSource {
            sensors: vec![make_sensor(7, "new switch")],
            calls: AtomicUsize::new(0),
        };
        let lookup = CachedSensorLookup::new(SensorCache::new(), source);

        assert_eq!(lookup.lookup_sensor(7).await.unwrap().name, "new switch");
        assert_eq!(lookup.source.calls.load(Ordering::SeqCst), 1);
        // now cached
        assert!(lookup.cache().get(7).await.is_some());

        // refreshed just now, so a second miss does not refetch
        assert!(matches!(lookup.lookup_sensor(8).await, Err(LookupError::NotFound(8))));
        assert_eq!(lookup.source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_misses_refresh_once_per_interval() {
        let source = FakeSource { sensors: vec![], calls: AtomicUsize::new(0) };
        let lookup = CachedSensorLookup::new(SensorCache::new(), source)
            .with_min_refresh_interval(Duration::from_secs(30));

        for _ in 0..5 {
            assert!(matches!(lookup.lookup_sensor(99).await, Err(LookupError::NotFound(99))));
        }
        assert_eq!(lookup.source.calls.load(Ordering::SeqCst), 1);

        time::advance(Duration::from_secs(31)).await;
        assert!(matches!(lookup.lookup_sensor(99).await, Err(LookupError::NotFound(99))));
        assert_eq!(lookup.source.calls.load(Ordering::SeqCst), 2);
    }

    struct HangingSource;

    #[async_trait]
    impl SensorSource for HangingSource {
        async fn fetch_sensors(&self) -> anyhow::Result<HashMap<i64, Sensor>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_refresh_times_out() {
        let lookup = CachedSensorLookup::new(SensorCache::new(), HangingSource)
            .with_refresh_timeout(Duration::from_secs(10));

        let started = Instant::now();
        let err = lookup.lookup_sensor(1).await.unwrap_err();
        assert!(matches!(err, LookupError::Timeout(t) if t == Duration::from_secs(10)));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cached_lookup_reports_refresh_failure() {
        let lookup = CachedSensorLookup::new(SensorCache::new(), FailingSource);
        let err = lookup.lookup_sensor(1).await.unwrap_err();
        assert!(matches!(err, LookupError::Refresh(_)));
        assert!(err.to_string().contains("gateway unreachable"));
    }
}
