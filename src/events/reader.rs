use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};

use super::{EventReader, RawEvent, SensorEvent};
use crate::{
    registry::{LookupError, SensorLookup},
    sensors::Sensor,
};

pub const DEFAULT_REDIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Lifecycle of the event loop.
///
/// `Idle → Dialing → Connected`, back to `Dialing` on connection loss, and
/// `Stopping → Idle` once a stop request is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Dialing,
    Connected,
    Stopping,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StartError {
    #[error("cannot run without {0}")]
    Misconfigured(&'static str),

    #[error("event reader is already running")]
    AlreadyRunning,
}

type ReaderSlot = Arc<Mutex<Option<Box<dyn EventReader>>>>;

/// Reads gateway events in a background task and turns them into
/// `SensorEvent`s on an output queue, redialing whenever the connection drops.
///
/// The event reader is moved into the task while it runs and handed back when
/// it stops, so a stopped loop can be started again.
pub struct SensorEventReader {
    lookup: Option<Arc<dyn SensorLookup>>,
    reader: ReaderSlot,
    backoff: Duration,
    stop: watch::Sender<bool>,
    state: Arc<watch::Sender<LoopState>>,
    task: Option<JoinHandle<()>>,
}

impl Default for SensorEventReader {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorEventReader {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            lookup: None,
            reader: Arc::new(Mutex::new(None)),
            backoff: DEFAULT_REDIAL_BACKOFF,
            stop,
            state: Arc::new(state),
            task: None,
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn SensorLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn with_reader(self, reader: impl EventReader + 'static) -> Self {
        *lock(&self.reader) = Some(Box::new(reader));
        self
    }

    /// Wait between failed dial attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Watch loop state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Spawns the event loop. Returns immediately.
    ///
    /// Events are delivered to `out` in the order they were read. The loop
    /// also stops on its own once every receiver of `out` is dropped.
    pub fn start(&mut self, out: mpsc::Sender<SensorEvent>) -> Result<(), StartError> {
        if self.is_running() {
            return Err(StartError::AlreadyRunning);
        }
        let lookup = self
            .lookup
            .clone()
            .ok_or(StartError::Misconfigured("a sensor lookup"))?;
        let reader = lock(&self.reader)
            .take()
            .ok_or(StartError::Misconfigured("an event reader"))?;

        self.stop.send_replace(false);
        self.state.send_replace(LoopState::Dialing);

        let event_loop = EventLoop {
            reader,
            lookup,
            out,
            backoff: self.backoff,
            stop: self.stop.subscribe(),
            state: Arc::clone(&self.state),
        };
        let slot = Arc::clone(&self.reader);
        self.task = Some(tokio::spawn(async move {
            let reader = event_loop.run().await;
            *lock(&slot) = Some(reader);
        }));

        info!(backoff_secs = self.backoff.as_secs(), "Sensor event loop started");
        Ok(())
    }

    /// Signals the loop to stop at its next iteration boundary.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Signals the loop to stop and waits until the transport is closed.
    pub async fn stop(&mut self) {
        self.request_stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Sensor event loop task failed");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once a stop is requested or the controlling handle is gone.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

struct EventLoop {
    reader: Box<dyn EventReader>,
    lookup: Arc<dyn SensorLookup>,
    out: mpsc::Sender<SensorEvent>,
    backoff: Duration,
    stop: watch::Receiver<bool>,
    state: Arc<watch::Sender<LoopState>>,
}

impl EventLoop {
    async fn run(mut self) -> Box<dyn EventReader> {
        'redial: while !self.should_stop() {
            self.set_state(LoopState::Dialing);
            if !self.dial().await {
                break;
            }
            self.set_state(LoopState::Connected);

            loop {
                if self.should_stop() {
                    break 'redial;
                }

                let next = tokio::select! {
                    biased;
                    _ = stop_requested(&mut self.stop) => None,
                    next = self.reader.read_event() => Some(next),
                };
                let Some(next) = next else {
                    break 'redial;
                };

                let raw = match next {
                    Ok(raw) => raw,
                    Err(e) if e.is_recoverable() => {
                        warn!(error = %e, "Dropping event");
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "Event stream failed; redialing");
                        continue 'redial;
                    }
                };

                let Some(id) = sensor_id(&raw) else {
                    continue;
                };
                let looked_up = tokio::select! {
                    biased;
                    _ = stop_requested(&mut self.stop) => None,
                    looked_up = self.lookup.lookup_sensor(id) => Some(looked_up),
                };
                let Some(looked_up) = looked_up else {
                    break 'redial;
                };
                let Some(event) = bind(id, looked_up, raw) else {
                    continue;
                };

                let sent = tokio::select! {
                    biased;
                    sent = self.out.send(event) => Some(sent),
                    _ = stop_requested(&mut self.stop) => None,
                };
                match sent {
                    Some(Ok(())) => {}
                    Some(Err(_)) => {
                        warn!("Sensor event queue closed; stopping event loop");
                        break 'redial;
                    }
                    None => break 'redial,
                }
            }
        }

        self.set_state(LoopState::Stopping);
        match self.reader.close().await {
            Ok(()) => info!("Event stream closed"),
            Err(e) => error!(error = %e, "Failed to close event stream"),
        }
        self.set_state(LoopState::Idle);

        self.reader
    }

    fn should_stop(&self) -> bool {
        *self.stop.borrow() || self.stop.has_changed().is_err()
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }

    /// Dials until connected, waiting `backoff` after each failure.
    /// Returns `false` if a stop was requested first.
    async fn dial(&mut self) -> bool {
        loop {
            if self.should_stop() {
                return false;
            }

            let dialed = tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop) => return false,
                dialed = self.reader.dial() => dialed,
            };

            match dialed {
                Ok(()) => {
                    info!("Event stream connected");
                    return true;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_secs = self.backoff.as_secs(),
                        "Error connecting event stream; retrying after backoff"
                    );
                    tokio::select! {
                        biased;
                        _ = stop_requested(&mut self.stop) => return false,
                        _ = time::sleep(self.backoff) => {}
                    }
                }
            }
        }
    }
}

/// Id of a sensor event worth resolving; `None` drops the event.
fn sensor_id(raw: &RawEvent) -> Option<i64> {
    if !raw.is_sensor_event() {
        debug!(resource = %raw.resource_name, "Dropping non-sensor event");
        return None;
    }
    if raw.id.is_none() {
        debug!(event = %raw.event_kind, "Dropping sensor event without id");
    }
    raw.id
}

/// Binds the looked-up sensor to the event, or drops it.
fn bind(id: i64, looked_up: Result<Sensor, LookupError>, raw: RawEvent) -> Option<SensorEvent> {
    let sensor = match looked_up {
        Ok(sensor) => sensor,
        Err(e) => {
            warn!(sensor_id = id, error = %e, "Dropping event; could not look up sensor");
            return None;
        }
    };

    match SensorEvent::decode(sensor, raw) {
        Ok(Some(event)) => Some(event),
        Ok(None) => {
            debug!(sensor_id = id, "Dropping sensor event without state");
            None
        }
        Err(e) => {
            warn!(sensor_id = id, error = %e, "Dropping event; could not decode state");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::{
        events::ReadError,
        registry::{CachedSensorLookup, SensorCache, SensorSource},
        sensors::{Sensor, SensorConfig, SensorState},
    };

    const TEMPERATURE_EVENT: &str = r#"{"e":"changed","id":"1","r":"sensors","state":{"lastupdated":"2018-03-08T19:35:24","temperature":2062},"t":"event"}"#;
    const PRESSURE_EVENT: &str = r#"{"e":"changed","id":"3","r":"sensors","state":{"lastupdated":"2018-03-08T19:35:24","pressure":993},"t":"event"}"#;
    const SWITCH_EVENT: &str = r#"{"e":"changed","id":"7","r":"sensors","state":{"buttonevent":1000,"lastupdated":"2018-03-20T20:52:18"},"t":"event"}"#;
    const LIGHT_EVENT: &str = r#"{"e":"changed","id":"1","r":"lights","state":{"on":true},"t":"event"}"#;
    const UNKNOWN_SENSOR_EVENT: &str = r#"{"e":"changed","id":"99","r":"sensors","state":{"lastupdated":"2018-03-08T19:35:24"},"t":"event"}"#;

    enum Step {
        Event(&'static str),
        Malformed,
        Lost,
    }

    #[derive(Default)]
    struct Stats {
        dials: AtomicUsize,
        closes: AtomicUsize,
    }

    /// Event reader driven by a fixed script. Reads block forever once the
    /// script is exhausted.
    struct ScriptedReader {
        dial_results: VecDeque<bool>,
        steps: VecDeque<Step>,
        fail_close: bool,
        stats: Arc<Stats>,
    }

    impl ScriptedReader {
        fn new(steps: Vec<Step>) -> (Self, Arc<Stats>) {
            let stats = Arc::new(Stats::default());
            let reader = Self {
                dial_results: VecDeque::new(),
                steps: steps.into(),
                fail_close: false,
                stats: Arc::clone(&stats),
            };
            (reader, stats)
        }

        fn with_dial_results(mut self, results: Vec<bool>) -> Self {
            self.dial_results = results.into();
            self
        }
    }

    #[async_trait]
    impl EventReader for ScriptedReader {
        async fn dial(&mut self) -> anyhow::Result<()> {
            self.stats.dials.fetch_add(1, Ordering::SeqCst);
            match self.dial_results.pop_front() {
                Some(false) => anyhow::bail!("connection refused"),
                _ => Ok(()),
            }
        }

        async fn read_event(&mut self) -> Result<RawEvent, ReadError> {
            match self.steps.pop_front() {
                Some(Step::Event(payload)) => Ok(RawEvent::from_slice(payload.as_bytes())?),
                Some(Step::Malformed) => Err(RawEvent::from_slice(b"{\"e\":").unwrap_err().into()),
                Some(Step::Lost) => Err(ReadError::ConnectionLost("peer reset".to_owned())),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                anyhow::bail!("already closed");
            }
            Ok(())
        }
    }

    fn sensor(id: i64, sensor_type: &str) -> Sensor {
        Sensor {
            id,
            sensor_type: sensor_type.to_owned(),
            name: format!("sensor {id}"),
            last_seen: None,
            config: SensorConfig::default(),
            state: SensorState::Empty,
        }
    }

    async fn lookup() -> Arc<dyn SensorLookup> {
        let cache = SensorCache::new();
        cache.update(sensor(1, "ZHATemperature")).await;
        cache.update(sensor(3, "ZHAPressure")).await;
        cache.update(sensor(7, "ZHASwitch")).await;
        Arc::new(cache)
    }

    #[tokio::test]
    async fn start_without_lookup_is_misconfigured() {
        let (reader, _) = ScriptedReader::new(vec![]);
        let (tx, _rx) = mpsc::channel(4);
        let mut r = SensorEventReader::new().with_reader(reader);
        assert_eq!(r.start(tx), Err(StartError::Misconfigured("a sensor lookup")));
        assert_eq!(r.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn start_without_reader_is_misconfigured() {
        let (tx, _rx) = mpsc::channel(4);
        let mut r = SensorEventReader::new().with_lookup(lookup().await);
        assert_eq!(r.start(tx), Err(StartError::Misconfigured("an event reader")));
        assert!(!r.is_running());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (reader, _) = ScriptedReader::new(vec![]);
        let (tx, _rx) = mpsc::channel(4);
        let mut r = SensorEventReader::new().with_lookup(lookup().await).with_reader(reader);

        r.start(tx.clone()).unwrap();
        assert_eq!(r.start(tx), Err(StartError::AlreadyRunning));
        r.stop().await;
    }

    #[tokio::test]
    async fn delivers_sensor_events_in_order() {
        let (reader, stats) = ScriptedReader::new(vec![
            Step::Event(TEMPERATURE_EVENT),
            Step::Event(PRESSURE_EVENT),
            Step::Event(SWITCH_EVENT),
        ]);
        let (tx, mut rx) = mpsc::channel(4);
        let mut r = SensorEventReader::new().with_lookup(lookup().await).with_reader(reader);
        r.start(tx).unwrap();

        let first = rx.recv().await.unwrap();
        let SensorState::Temperature(t) = first.state() else {
            panic!("expected temperature state");
        };
        assert_eq!(t.temperature, Some(2062));

        let second = rx.recv().await.unwrap();
        let SensorState::Pressure(p) = second.state() else {
            panic!("expected pressure state");
        };
        assert_eq!(p.pressure, Some(993));

        let third = rx.recv().await.unwrap();
        let SensorState::Switch(s) = third.state() else {
            panic!("expected switch state");
        };
        assert_eq!(s.buttonevent, Some(1000));
        assert_eq!(third.resource_id(), 7);

        r.stop().await;
        assert_eq!(r.state(), LoopState::Idle);
        assert_eq!(stats.dials.load(Ordering::SeqCst), 1);
        assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn irrelevant_and_broken_events_are_dropped_without_redial() {
        let (reader, stats) = ScriptedReader::new(vec![
            Step::Event(LIGHT_EVENT),
            Step::Event(UNKNOWN_SENSOR_EVENT),
            Step::Malformed,
            Step::Event(r#"{"e":"scene-called","gid":"1","r":"scenes","scid":"2","t":"event"}"#),
            Step::Event(r#"{"e":"changed","id":"1","r":"sensors","config":{"battery":90},"t":"event"}"#),
            Step::Event(r#"{"e":"changed","id":"3","r":"sensors","state":{"pressure":"high"},"t":"event"}"#),
            Step::Event(TEMPERATURE_EVENT),
        ]);
        let (tx, mut rx) = mpsc::channel(4);
        let mut r = SensorEventReader::new().with_lookup(lookup().await).with_reader(reader);
        r.start(tx).unwrap();

        let only = rx.recv().await.unwrap();
        assert_eq!(only.resource_id(), 1);
        assert!(matches!(only.state(), SensorState::Temperature(_)));

        r.stop().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn redials_after_backoff_and_resumes_delivery() {
        let (reader, stats) = ScriptedReader::new(vec![
            Step::Event(TEMPERATURE_EVENT),
            Step::Lost,
            Step::Event(PRESSURE_EVENT),
            Step::Event(SWITCH_EVENT),
        ]);
        let reader = reader.with_dial_results(vec![false, true, false, true]);
        let (tx, mut rx) = mpsc::channel(4);
        let mut r = SensorEventReader::new()
            .with_lookup(lookup().await)
            .with_reader(reader)
            .with_backoff(Duration::from_secs(5));

        let started = Instant::now();
        r.start(tx).unwrap();

        assert_eq!(rx.recv().await.unwrap().resource_id(), 1);
        assert!(started.elapsed() >= Duration::from_secs(5));

        assert_eq!(rx.recv().await.unwrap().resource_id(), 3);
        assert_eq!(rx.recv().await.unwrap().resource_id(), 7);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(stats.dials.load(Ordering::SeqCst), 4);
        assert_eq!(r.state(), LoopState::Connected);

        r.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_backoff() {
        let (reader, stats) = ScriptedReader::new(vec![]);
        let reader = reader.with_dial_results(vec![false; 100]);
        let (tx, _rx) = mpsc::channel(4);
        let mut r = SensorEventReader::new()
            .with_lookup(lookup().await)
            .with_reader(reader)
            .with_backoff(Duration::from_secs(3600));
        r.start(tx).unwrap();

        let mut state = r.subscribe();
        state.wait_for(|s| *s == LoopState::Dialing).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;

        let started = Instant::now();
        r.stop().await;
        assert!(started.elapsed() < Duration::from_secs(3600));
        assert_eq!(r.state(), LoopState::Idle);
        assert_eq!(stats.dials.load(Ordering::SeqCst), 1);
        assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_failure_still_reaches_idle() {
        let (mut reader, stats) = ScriptedReader::new(vec![]);
        reader.fail_close = true;
        let (tx, _rx) = mpsc::channel(4);
        let mut r = SensorEventReader::new().with_lookup(lookup().await).with_reader(reader);
        r.start(tx).unwrap();

        r.stop().await;
        assert_eq!(r.state(), LoopState::Idle);
        assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn can_restart_after_stop() {
        let (reader, stats) = ScriptedReader::new(vec![]);
        let (tx, _rx) = mpsc::channel(4);
        let mut r = SensorEventReader::new().with_lookup(lookup().await).with_reader(reader);

        r.start(tx.clone()).unwrap();
        r.stop().await;
        r.start(tx).unwrap();
        assert!(r.is_running());
        r.stop().await;

        assert_eq!(stats.dials.load(Ordering::SeqCst), 2);
        assert_eq!(stats.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_consumer_stops_loop() {
        let (reader, stats) = ScriptedReader::new(vec![Step::Event(TEMPERATURE_EVENT)]);
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let mut r = SensorEventReader::new().with_lookup(lookup().await).with_reader(reader);
        let mut state = r.subscribe();
        r.start(tx).unwrap();

        state.wait_for(|s| *s == LoopState::Idle).await.unwrap();
        assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
        r.stop().await;
        assert!(!r.is_running());
    }

    /// Inventory source whose fetch never completes.
    struct HangingSource {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SensorSource for HangingSource {
        async fn fetch_sensors(&self) -> anyhow::Result<HashMap<i64, Sensor>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_hung_sensor_lookup() {
        let (reader, stats) = ScriptedReader::new(vec![Step::Event(UNKNOWN_SENSOR_EVENT)]);
        let calls = Arc::new(AtomicUsize::new(0));
        let source = HangingSource { calls: Arc::clone(&calls) };
        let lookup = CachedSensorLookup::new(SensorCache::new(), source)
            .with_refresh_timeout(Duration::from_secs(3600));
        let (tx, _rx) = mpsc::channel(4);
        let mut r = SensorEventReader::new().with_lookup(Arc::new(lookup)).with_reader(reader);
        r.start(tx).unwrap();

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.state(), LoopState::Connected);

        time::timeout(Duration::from_secs(3), r.stop())
            .await
            .expect("stop must not wait for the lookup");
        assert_eq!(r.state(), LoopState::Idle);
        assert_eq!(stats.closes.load(Ordering::SeqCst), 1);
    }
}
