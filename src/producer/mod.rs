//! Analysis producers: independent, self-scheduling generators of events.
//!
//! The gaze and audio producers are interval driven and share the generic
//! [`AnalysisProducer`] runner; the screen monitor reacts to discrete
//! triggers instead. All of them emit into an [`EventSink`] and never block.
//!
//! Readings are synthetic. Every statistical draw goes through an injected
//! [`StdRng`] so a fixed seed reproduces a session exactly.

pub mod audio;
pub mod gaze;
pub mod schedule;
pub mod screen;

use crate::event::{Event, EventClock, EventType};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::any::Any;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub use audio::AudioAnalyzer;
pub use gaze::GazeAnalyzer;
pub use schedule::RepeatingTask;
pub use screen::{ActivitySummary, KeyInput, ScreenMonitor, ScreenTrigger};

/// Destination for produced events.
pub trait EventSink: Send + Sync {
    /// Hand over an event. Must not block.
    fn emit(&self, event: Event);
}

pub type SharedSink = Arc<dyn EventSink>;

impl EventSink for crossbeam_channel::Sender<Event> {
    fn emit(&self, event: Event) {
        match self.try_send(event) {
            Ok(()) => {}
            Err(crossbeam_channel::TrySendError::Full(event)) => {
                tracing::warn!(
                    "Event sink full, dropping {} event for {}",
                    event.event_type(),
                    event.session_id()
                );
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                tracing::debug!("Event sink disconnected");
            }
        }
    }
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<Event> {
    fn emit(&self, event: Event) {
        if self.send(event).is_err() {
            tracing::debug!("Event sink closed");
        }
    }
}

/// Errors raised inside a single analysis cycle.
#[derive(Debug)]
pub enum ProducerError {
    /// A sampled value fell outside its model's domain
    InvalidReading(String),
    /// The reading could not be encoded as a payload
    Encode(serde_json::Error),
    /// The analyzer panicked mid-cycle
    Panicked(String),
}

impl std::fmt::Display for ProducerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProducerError::InvalidReading(msg) => write!(f, "Invalid reading: {msg}"),
            ProducerError::Encode(e) => write!(f, "Failed to encode reading: {e}"),
            ProducerError::Panicked(msg) => write!(f, "Analyzer panicked: {msg}"),
        }
    }
}

impl std::error::Error for ProducerError {}

impl From<serde_json::Error> for ProducerError {
    fn from(e: serde_json::Error) -> Self {
        ProducerError::Encode(e)
    }
}

impl ProducerError {
    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = match payload.downcast::<String>() {
            Ok(msg) => *msg,
            Err(payload) => payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown panic".to_string()),
        };
        ProducerError::Panicked(msg)
    }
}

/// One sensor domain's statistical model.
pub trait Analyzer: Send + 'static {
    /// Short producer name used in status events ("gaze", "audio").
    fn name(&self) -> &'static str;

    /// Category of the events this analyzer produces.
    fn event_type(&self) -> EventType;

    /// Drop all rolling history.
    fn reset(&mut self);

    /// Compute one reading at `now_ms`.
    fn analyze(&mut self, rng: &mut StdRng, now_ms: i64) -> Result<Value, ProducerError>;
}

/// Build an RNG from an optional seed.
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Lifecycle event (`monitoring_started`, `monitoring_stopped`, `error`).
pub(crate) fn status_event(
    session_id: &str,
    timestamp: i64,
    producer: &str,
    status: &str,
    message: String,
    extra: Value,
) -> Event {
    let mut data = json!({
        "status": status,
        "producer": producer,
        "message": message,
    });
    if let (Some(map), Value::Object(extra)) = (data.as_object_mut(), extra) {
        map.extend(extra);
    }
    Event::new(EventType::System, session_id, timestamp, data)
}

pub(crate) fn device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-device".to_string())
}

/// State touched by one producer's cycles. Guarded by a single mutex so that
/// `stop()` and a cycle can never interleave.
struct CycleState<A> {
    analyzer: A,
    rng: StdRng,
    clock: EventClock,
    sink: SharedSink,
    session_id: String,
    running: bool,
    produced: u64,
    errors: u64,
}

impl<A: Analyzer> CycleState<A> {
    fn run_once(&mut self) -> ControlFlow<()> {
        if !self.running {
            return ControlFlow::Break(());
        }

        let now = self.clock.stamp();
        // A panic must not unwind into the repeating task and end the loop.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.analyzer.analyze(&mut self.rng, now)
        }))
        .unwrap_or_else(|payload| Err(ProducerError::from_panic(payload)));
        let event = match outcome {
            Ok(data) => {
                self.produced += 1;
                Event::new(self.analyzer.event_type(), self.session_id.as_str(), now, data)
            }
            Err(e) => {
                self.errors += 1;
                tracing::warn!("{} analysis cycle failed: {}", self.analyzer.name(), e);
                status_event(
                    &self.session_id,
                    now,
                    self.analyzer.name(),
                    "error",
                    format!("{} analysis failed: {e}", self.analyzer.name()),
                    Value::Null,
                )
            }
        };
        self.sink.emit(event);
        ControlFlow::Continue(())
    }
}

fn lock<A>(state: &Mutex<CycleState<A>>) -> MutexGuard<'_, CycleState<A>> {
    // Analyzer panics are caught inside the cycle, so poisoning only follows
    // a panic in the sink. The state is still between cycles then.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Interval-driven producer around an [`Analyzer`].
pub struct AnalysisProducer<A: Analyzer> {
    state: Arc<Mutex<CycleState<A>>>,
    interval: Duration,
    task: Option<RepeatingTask>,
}

impl<A: Analyzer> AnalysisProducer<A> {
    pub fn new(
        analyzer: A,
        session_id: impl Into<String>,
        interval: Duration,
        sink: SharedSink,
        rng: StdRng,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(CycleState {
                analyzer,
                rng,
                clock: EventClock::new(),
                sink,
                session_id: session_id.into(),
                running: false,
                produced: 0,
                errors: 0,
            })),
            interval,
            task: None,
        }
    }

    /// Start the analysis cycle. No-op if already running.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(&mut self) {
        {
            let mut state = lock(&self.state);
            if state.running {
                tracing::debug!("{} producer already running", state.analyzer.name());
                return;
            }
            state.running = true;
            state.produced = 0;
            state.errors = 0;
            state.analyzer.reset();

            let now = state.clock.stamp();
            let name = state.analyzer.name();
            let event = status_event(
                &state.session_id,
                now,
                name,
                "monitoring_started",
                format!("{name} monitoring started"),
                json!({ "device": device_name(), "interval_ms": self.interval.as_millis() as u64 }),
            );
            state.sink.emit(event);
            tracing::info!("{} producer started for session {}", name, state.session_id);
        }

        let state = self.state.clone();
        self.task = Some(RepeatingTask::spawn(self.interval, move || {
            lock(&state).run_once()
        }));
    }

    /// Stop the analysis cycle. No-op if not running.
    pub fn stop(&mut self) {
        {
            let mut state = lock(&self.state);
            if !state.running {
                return;
            }
            state.running = false;
            state.analyzer.reset();

            let now = state.clock.stamp();
            let name = state.analyzer.name();
            let event = status_event(
                &state.session_id,
                now,
                name,
                "monitoring_stopped",
                format!("{name} monitoring stopped"),
                json!({ "events_produced": state.produced, "errors": state.errors }),
            );
            state.sink.emit(event);
            tracing::info!(
                "{} producer stopped after {} events",
                name,
                state.produced
            );
        }

        if let Some(task) = self.task.take() {
            task.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    /// Analysis events produced since the last `start()`.
    pub fn produced(&self) -> u64 {
        lock(&self.state).produced
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};

    /// Fails every other cycle.
    struct FlakyAnalyzer {
        calls: u32,
        resets: u32,
    }

    impl Analyzer for FlakyAnalyzer {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn event_type(&self) -> EventType {
            EventType::Gaze
        }

        fn reset(&mut self) {
            self.resets += 1;
        }

        fn analyze(&mut self, _rng: &mut StdRng, _now_ms: i64) -> Result<Value, ProducerError> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                Err(ProducerError::InvalidReading("sensor glitch".into()))
            } else {
                Ok(json!({ "cycle": self.calls }))
            }
        }
    }

    fn flaky_producer() -> (AnalysisProducer<FlakyAnalyzer>, Receiver<Event>) {
        let (tx, rx) = unbounded();
        let producer = AnalysisProducer::new(
            FlakyAnalyzer { calls: 0, resets: 0 },
            "S-test",
            Duration::from_secs(1),
            Arc::new(tx),
            seeded_rng(Some(7)),
        );
        (producer, rx)
    }

    /// Panics on its second cycle only.
    struct PanickyAnalyzer {
        calls: u32,
    }

    impl Analyzer for PanickyAnalyzer {
        fn name(&self) -> &'static str {
            "panicky"
        }

        fn event_type(&self) -> EventType {
            EventType::Audio
        }

        fn reset(&mut self) {}

        fn analyze(&mut self, _rng: &mut StdRng, _now_ms: i64) -> Result<Value, ProducerError> {
            self.calls += 1;
            if self.calls == 2 {
                panic!("model blew up");
            }
            Ok(json!({ "cycle": self.calls }))
        }
    }

    fn status_of(event: &Event) -> Option<&str> {
        event.field("status").and_then(|v| v.as_str())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_emits_status_before_first_cycle() {
        let (mut producer, rx) = flaky_producer();
        producer.start();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.event_type(), &EventType::System);
        assert_eq!(status_of(&first), Some("monitoring_started"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = rx.try_recv().unwrap();
        assert_eq!(second.event_type(), &EventType::Gaze);
        producer.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_cycle_does_not_stop_producer() {
        let (mut producer, rx) = flaky_producer();
        producer.start();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        producer.stop();

        let events: Vec<Event> = rx.try_iter().collect();
        // started, ok, error, ok, error, stopped
        assert_eq!(events.len(), 6);
        assert_eq!(status_of(&events[2]), Some("error"));
        assert_eq!(events[3].event_type(), &EventType::Gaze);
        assert_eq!(status_of(&events[4]), Some("error"));

        let stopped = &events[5];
        assert_eq!(status_of(stopped), Some("monitoring_stopped"));
        assert_eq!(stopped.field("events_produced"), Some(&json!(2)));
        assert_eq!(stopped.field("errors"), Some(&json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_cycle_is_reported_and_loop_survives() {
        let (tx, rx) = unbounded();
        let mut producer = AnalysisProducer::new(
            PanickyAnalyzer { calls: 0 },
            "S-test",
            Duration::from_secs(1),
            Arc::new(tx),
            seeded_rng(Some(7)),
        );
        producer.start();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(producer.is_running());
        producer.stop();

        let events: Vec<Event> = rx.try_iter().collect();
        // started, ok, panic, ok, ok, stopped
        assert_eq!(events.len(), 6);
        assert_eq!(status_of(&events[2]), Some("error"));
        let message = events[2].field("message").and_then(|v| v.as_str()).unwrap();
        assert!(message.contains("model blew up"));
        assert_eq!(events[3].event_type(), &EventType::Audio);
        assert_eq!(events[4].event_type(), &EventType::Audio);

        let stopped = &events[5];
        assert_eq!(stopped.field("events_produced"), Some(&json!(3)));
        assert_eq!(stopped.field("errors"), Some(&json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let (mut producer, rx) = flaky_producer();
        producer.start();
        producer.start();
        assert!(producer.is_running());

        producer.stop();
        producer.stop();
        assert!(!producer.is_running());

        let statuses: Vec<String> = rx
            .try_iter()
            .filter_map(|e| status_of(&e).map(str::to_string))
            .filter(|s| s.starts_with("monitoring"))
            .collect();
        assert_eq!(statuses, vec!["monitoring_started", "monitoring_stopped"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_events_after_stop() {
        let (mut producer, rx) = flaky_producer();
        producer.start();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        producer.stop();
        let _: Vec<Event> = rx.try_iter().collect();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamps_non_decreasing() {
        let (mut producer, rx) = flaky_producer();
        producer.start();
        tokio::time::sleep(Duration::from_millis(4500)).await;
        producer.stop();

        let stamps: Vec<i64> = rx.try_iter().map(|e| e.timestamp()).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }
}
