use chrono::{DateTime, Utc};
use rollcall_core::{
    AttendanceRecord, CaptureError, Descriptor, DescriptorOracle, EuclideanMatcher, Event,
    EventId, FrameSource, MatchOutcome, Matcher, RegistryEntry, Settings, StudentId,
};
use rollcall_store::{RecordRequest, Recorded, Store, StoreError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const REPORT_CHANNEL_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no active event selected")]
    NoActiveEvent,
    #[error("event not found: {0}")]
    EventNotFound(EventId),
    #[error("session already running")]
    AlreadyRunning,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("session task failed: {0}")]
    TaskFailed(#[from] JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    Scanning,
    Processing,
    Stopped,
}

/// Per-tick configuration. Each tick works from the snapshot current at its
/// start; updates land on the next tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Target event. `None` at start means "the store's active event".
    pub event_id: Option<EventId>,
    pub threshold: f32,
    pub tick_interval: Duration,
    pub oracle_timeout: Duration,
    pub low_light_threshold: f32,
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings, event_id: Option<EventId>) -> Self {
        Self {
            event_id,
            threshold: settings.match_threshold,
            tick_interval: settings.tick_interval(),
            oracle_timeout: settings.oracle_timeout(),
            low_light_threshold: settings.low_light_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    NoFace,
    NoTrainedStudents,
    Unrecognized { nearest: Option<f32> },
    Recorded { record: AttendanceRecord, distance: f32 },
    AlreadyMarked { student_id: StudentId, distance: f32 },
    CaptureFailed(String),
    OracleFailed(String),
    OracleTimedOut,
    StoreFailed(String),
    FeedEnded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub event_id: EventId,
    pub sequence: Option<u64>,
    /// Derived lighting hint; absent when the frame carried no luma plane.
    pub low_light: Option<bool>,
    pub outcome: TickOutcome,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub ticks: u64,
    pub ticks_dropped: u64,
    pub recorded: u64,
    pub already_marked: u64,
    pub unrecognized: u64,
    pub no_face: u64,
    pub failures: u64,
}

impl SessionStats {
    fn observe(&mut self, outcome: &TickOutcome) {
        match outcome {
            TickOutcome::Recorded { .. } => self.recorded += 1,
            TickOutcome::AlreadyMarked { .. } => self.already_marked += 1,
            TickOutcome::Unrecognized { .. } | TickOutcome::NoTrainedStudents => {
                self.unrecognized += 1
            }
            TickOutcome::NoFace => self.no_face += 1,
            TickOutcome::FeedEnded => {}
            _ => self.failures += 1,
        }
    }
}

/// Event and registry snapshot a tick matches against.
struct ActiveContext {
    event: Event,
    registry: Vec<RegistryEntry>,
    /// Students already recorded for `event`, so repeat sightings skip the store.
    marked: Mutex<HashSet<StudentId>>,
}

impl ActiveContext {
    async fn load(store: &Store, event_id: &EventId) -> Result<Self, SessionError> {
        let event = store
            .get_event(event_id)
            .await?
            .ok_or_else(|| SessionError::EventNotFound(event_id.clone()))?;
        let registry = store.list_trained().await?;
        let marked = store
            .attendance_by_event(event_id)
            .await?
            .into_iter()
            .map(|r| r.student_id)
            .collect();
        tracing::info!(
            event = %event.id,
            start = %event.start_time,
            trained = registry.len(),
            "session context loaded"
        );
        Ok(Self {
            event,
            registry,
            marked: Mutex::new(marked),
        })
    }

    fn is_marked(&self, id: &StudentId) -> bool {
        self.marked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(id)
    }

    fn mark(&self, id: StudentId) {
        self.marked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id);
    }
}

/// Attendance-taking session: polls a frame source, asks the oracle for a
/// descriptor, matches it and records attendance.
///
/// A session can be started again after it stops.
pub struct Session<S, O> {
    store: Store,
    source: Arc<S>,
    oracle: Arc<O>,
    state: Arc<watch::Sender<SessionState>>,
    reports: broadcast::Sender<TickReport>,
}

impl<S, O> Session<S, O>
where
    S: FrameSource + 'static,
    O: DescriptorOracle + 'static,
{
    pub fn new(store: Store, source: Arc<S>, oracle: Arc<O>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        Self {
            store,
            source,
            oracle,
            state: Arc::new(state),
            reports,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Tick reports for every run of this session.
    pub fn subscribe(&self) -> broadcast::Receiver<TickReport> {
        self.reports.subscribe()
    }

    /// Load the event and registry, then begin scanning.
    ///
    /// Fails without scanning when no event is selected and none is active.
    pub async fn start(&self, mut config: SessionConfig) -> Result<SessionHandle, SessionError> {
        let claimed = self.state.send_if_modified(|s| {
            if matches!(s, SessionState::Idle | SessionState::Stopped) {
                *s = SessionState::Initializing;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(SessionError::AlreadyRunning);
        }

        let ctx = match self.initialize(&mut config).await {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::warn!(error = %e, "session failed to initialize");
                self.state.send_replace(SessionState::Idle);
                return Err(e);
            }
        };

        let (config_tx, config_rx) = watch::channel(config);
        let cancel = CancellationToken::new();
        let runner = Runner {
            store: self.store.clone(),
            source: Arc::clone(&self.source),
            oracle: Arc::clone(&self.oracle),
            state: Arc::clone(&self.state),
            reports: self.reports.clone(),
            config: config_rx,
            cancel: cancel.clone(),
        };

        self.state.send_replace(SessionState::Scanning);
        let task = tokio::spawn(runner.run(Arc::new(ctx)));

        Ok(SessionHandle {
            store: self.store.clone(),
            config: config_tx,
            cancel,
            task,
        })
    }

    async fn initialize(&self, config: &mut SessionConfig) -> Result<ActiveContext, SessionError> {
        let event_id = match config.event_id.clone() {
            Some(id) => id,
            None => self
                .store
                .active_event()
                .await?
                .map(|e| e.id)
                .ok_or(SessionError::NoActiveEvent)?,
        };
        let ctx = ActiveContext::load(&self.store, &event_id).await?;
        config.event_id = Some(event_id);
        Ok(ctx)
    }
}

/// Control handle for a running session.
pub struct SessionHandle {
    store: Store,
    config: watch::Sender<SessionConfig>,
    cancel: CancellationToken,
    task: JoinHandle<SessionStats>,
}

impl SessionHandle {
    pub fn config(&self) -> SessionConfig {
        self.config.borrow().clone()
    }

    /// Retarget the session. Takes effect from the next tick.
    pub async fn switch_event(&self, event_id: EventId) -> Result<Event, SessionError> {
        let event = self
            .store
            .get_event(&event_id)
            .await?
            .ok_or_else(|| SessionError::EventNotFound(event_id.clone()))?;
        self.config.send_modify(|c| c.event_id = Some(event_id));
        tracing::info!(event = %event.id, "session event switched");
        Ok(event)
    }

    /// Request a stop. A tick already processing runs to completion; no new
    /// tick starts.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the session to end (after [`stop`](Self::stop) or end of feed).
    pub async fn join(self) -> Result<SessionStats, SessionError> {
        Ok(self.task.await?)
    }

    pub async fn shutdown(self) -> Result<SessionStats, SessionError> {
        self.stop();
        self.join().await
    }
}

struct Runner<S, O> {
    store: Store,
    source: Arc<S>,
    oracle: Arc<O>,
    state: Arc<watch::Sender<SessionState>>,
    reports: broadcast::Sender<TickReport>,
    config: watch::Receiver<SessionConfig>,
    cancel: CancellationToken,
}

/// What a finished tick hands back to the loop.
struct TickResult {
    /// `None` when a stop interrupted the tick before it had an outcome.
    report: Option<TickReport>,
    /// Set when the tick reloaded the context for a switched event.
    context: Option<Arc<ActiveContext>>,
}

impl<S, O> Runner<S, O>
where
    S: FrameSource + 'static,
    O: DescriptorOracle + 'static,
{
    async fn run(self, mut ctx: Arc<ActiveContext>) -> SessionStats {
        let mut period = self.config.borrow().tick_interval;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Reports a tick publishes before it finishes (oracle timeouts).
        let (notice_tx, mut notices) = mpsc::unbounded_channel::<TickReport>();
        let mut in_flight: Option<JoinHandle<TickResult>> = None;
        let mut stats = SessionStats::default();
        let mut feed_ended = false;

        tracing::info!(event = %ctx.event.id, period_ms = period.as_millis() as u64, "session scanning");

        while !feed_ended {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(notice) = notices.recv() => {
                    self.publish(notice, &mut stats);
                }
                joined = wait_in_flight(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    self.state.send_replace(SessionState::Scanning);
                    let (ended, next) = self.finish_tick(joined, &mut stats);
                    feed_ended = ended;
                    if let Some(next) = next {
                        ctx = next;
                    }
                }
                _ = ticker.tick() => {
                    if in_flight.is_some() {
                        // Single flight: a tick arriving mid-processing is dropped, not queued.
                        stats.ticks_dropped += 1;
                        tracing::trace!("tick dropped, previous tick still processing");
                    } else {
                        let config = self.config.borrow().clone();
                        if config.tick_interval != period {
                            period = config.tick_interval;
                            ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        }
                        self.state.send_replace(SessionState::Processing);
                        stats.ticks += 1;
                        let tick = Tick {
                            store: self.store.clone(),
                            source: Arc::clone(&self.source),
                            oracle: Arc::clone(&self.oracle),
                            config,
                            notices: notice_tx.clone(),
                            cancel: self.cancel.clone(),
                        };
                        in_flight = Some(tokio::spawn(tick.run(Arc::clone(&ctx))));
                    }
                }
            }
        }

        if let Some(handle) = in_flight.take() {
            tracing::debug!("waiting for in-flight tick before stopping");
            let joined = handle.await;
            while let Ok(notice) = notices.try_recv() {
                self.publish(notice, &mut stats);
            }
            self.finish_tick(joined, &mut stats);
        }

        self.state.send_replace(SessionState::Stopped);
        tracing::info!(
            ticks = stats.ticks,
            dropped = stats.ticks_dropped,
            recorded = stats.recorded,
            failures = stats.failures,
            "session stopped"
        );
        stats
    }

    fn publish(&self, report: TickReport, stats: &mut SessionStats) {
        stats.observe(&report.outcome);
        log_report(&report);
        // No subscribers is fine.
        let _ = self.reports.send(report);
    }

    /// Publish a finished tick. Returns whether the feed ended and the
    /// reloaded context, if any.
    fn finish_tick(
        &self,
        joined: Result<TickResult, JoinError>,
        stats: &mut SessionStats,
    ) -> (bool, Option<Arc<ActiveContext>>) {
        match joined {
            Ok(result) => {
                let mut ended = false;
                if let Some(report) = result.report {
                    ended = report.outcome == TickOutcome::FeedEnded;
                    self.publish(report, stats);
                }
                (ended, result.context)
            }
            Err(e) => {
                stats.failures += 1;
                tracing::error!(error = %e, "tick task failed");
                (false, None)
            }
        }
    }
}

async fn wait_in_flight(
    slot: &mut Option<JoinHandle<TickResult>>,
) -> Result<TickResult, JoinError> {
    match slot {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn log_report(report: &TickReport) {
    match &report.outcome {
        TickOutcome::Recorded { record, distance } => tracing::info!(
            student = %record.student_id,
            event = %record.event_id,
            status = %record.status,
            distance,
            "student recognized"
        ),
        TickOutcome::CaptureFailed(e) => tracing::warn!(error = %e, "frame capture failed"),
        TickOutcome::OracleFailed(e) => tracing::warn!(error = %e, "descriptor oracle failed"),
        TickOutcome::OracleTimedOut => tracing::warn!("descriptor oracle timed out, waiting for it"),
        TickOutcome::StoreFailed(e) => tracing::warn!(error = %e, "attendance store failed"),
        TickOutcome::FeedEnded => tracing::info!("frame feed ended"),
        other => tracing::debug!(outcome = ?other, low_light = ?report.low_light, "tick"),
    }
}

fn report(
    event_id: EventId,
    sequence: Option<u64>,
    low_light: Option<bool>,
    outcome: TickOutcome,
) -> TickReport {
    TickReport {
        event_id,
        sequence,
        low_light,
        outcome,
        at: Utc::now(),
    }
}

/// Frame sequence, lighting observation and outcome of one tick.
type Step = (Option<u64>, Option<bool>, TickOutcome);

/// One pass of capture → detect → match → record.
///
/// The tick stays in flight until the frame source and the oracle have both
/// returned, so at most one capture and one detection run at a time.
struct Tick<S, O> {
    store: Store,
    source: Arc<S>,
    oracle: Arc<O>,
    config: SessionConfig,
    notices: mpsc::UnboundedSender<TickReport>,
    cancel: CancellationToken,
}

impl<S, O> Tick<S, O>
where
    S: FrameSource + 'static,
    O: DescriptorOracle + 'static,
{
    async fn run(self, ctx: Arc<ActiveContext>) -> TickResult {
        let mut reloaded = None;
        let ctx = match &self.config.event_id {
            Some(id) if *id != ctx.event.id => match ActiveContext::load(&self.store, id).await {
                Ok(next) => {
                    let next = Arc::new(next);
                    reloaded = Some(Arc::clone(&next));
                    next
                }
                Err(e) => {
                    let outcome = TickOutcome::StoreFailed(e.to_string());
                    return TickResult {
                        report: Some(report(id.clone(), None, None, outcome)),
                        context: None,
                    };
                }
            },
            _ => ctx,
        };

        let report = self
            .pipeline(&ctx)
            .await
            .map(|(sequence, low_light, outcome)| {
                report(ctx.event.id.clone(), sequence, low_light, outcome)
            });
        TickResult {
            report,
            context: reloaded,
        }
    }

    async fn pipeline(&self, ctx: &ActiveContext) -> Option<Step> {
        // Waiting for a frame is idle time, so capture is not bounded by the
        // oracle timeout.
        let source = Arc::clone(&self.source);
        let capture = tokio::task::spawn_blocking(move || source.capture());
        let captured = tokio::select! {
            biased;
            joined = capture => joined,
            _ = self.cancel.cancelled() => {
                tracing::debug!("stopped while waiting for a frame");
                return None;
            }
        };
        let frame = match captured {
            Ok(Ok(frame)) => frame,
            Ok(Err(CaptureError::Exhausted)) => return Some((None, None, TickOutcome::FeedEnded)),
            Ok(Err(e)) => return Some((None, None, TickOutcome::CaptureFailed(e.to_string()))),
            Err(join) => return Some((None, None, TickOutcome::CaptureFailed(join.to_string()))),
        };
        let seq = Some(frame.sequence);
        let low_light = frame.is_low_light(self.config.low_light_threshold);

        let oracle = Arc::clone(&self.oracle);
        let mut detect = tokio::task::spawn_blocking(move || oracle.detect(&frame));
        let detected = match tokio::time::timeout(self.config.oracle_timeout, &mut detect).await {
            Ok(joined) => joined,
            Err(_) => {
                let notice = report(ctx.event.id.clone(), seq, low_light, TickOutcome::OracleTimedOut);
                let _ = self.notices.send(notice);
                // The late answer is still used; no new detection starts meanwhile.
                tokio::select! {
                    joined = &mut detect => joined,
                    _ = self.cancel.cancelled() => return None,
                }
            }
        };

        let outcome = match detected {
            Ok(Ok(Some(descriptor))) => self.resolve(ctx, &descriptor).await,
            Ok(Ok(None)) => TickOutcome::NoFace,
            Ok(Err(e)) => TickOutcome::OracleFailed(e.to_string()),
            Err(join) => TickOutcome::OracleFailed(join.to_string()),
        };
        Some((seq, low_light, outcome))
    }

    /// match → record.
    async fn resolve(&self, ctx: &ActiveContext, descriptor: &Descriptor) -> TickOutcome {
        if ctx.registry.is_empty() {
            return TickOutcome::NoTrainedStudents;
        }

        let matched = match EuclideanMatcher.compare(descriptor, &ctx.registry, self.config.threshold) {
            MatchOutcome::Matched(m) => m,
            MatchOutcome::NoMatch { nearest } => return TickOutcome::Unrecognized { nearest },
        };

        if ctx.is_marked(&matched.student_id) {
            return TickOutcome::AlreadyMarked {
                student_id: matched.student_id,
                distance: matched.distance,
            };
        }

        // The start time may have been edited since the context was loaded.
        let event_start = match self.store.get_event(&ctx.event.id).await {
            Ok(Some(event)) => event.start_time,
            Ok(None) => ctx.event.start_time,
            Err(e) => return TickOutcome::StoreFailed(e.to_string()),
        };

        let request = RecordRequest {
            student_id: matched.student_id.clone(),
            event_id: ctx.event.id.clone(),
            confidence: matched.confidence,
            recognized_at: Utc::now(),
            event_start,
        };
        match self.store.record_if_absent(request).await {
            Ok(Recorded::Inserted(record)) => {
                ctx.mark(matched.student_id);
                TickOutcome::Recorded {
                    record,
                    distance: matched.distance,
                }
            }
            Ok(Recorded::AlreadyPresent(_)) => {
                ctx.mark(matched.student_id.clone());
                TickOutcome::AlreadyMarked {
                    student_id: matched.student_id,
                    distance: matched.distance,
                }
            }
            Err(e) => TickOutcome::StoreFailed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rollcall_core::{AttendanceStatus, Descriptor, Frame, OracleError};
    use rollcall_store::{EventUpdate, NewEvent, NewStudent};
    use crate::feed::{FeedOracle, FeedSource};
    use std::collections::VecDeque;
    use std::io::{BufReader, Cursor, Read};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn d(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec()).unwrap()
    }

    struct TestSource {
        next: AtomicU64,
        limit: Option<u64>,
        luma: Option<Vec<u8>>,
    }

    impl TestSource {
        fn endless() -> Self {
            Self { next: AtomicU64::new(0), limit: None, luma: None }
        }
    }

    impl FrameSource for TestSource {
        fn capture(&self) -> Result<Frame, CaptureError> {
            let sequence = self.next.fetch_add(1, Ordering::SeqCst);
            if self.limit.is_some_and(|limit| sequence >= limit) {
                return Err(CaptureError::Exhausted);
            }
            Ok(Frame {
                data: Vec::new(),
                luma: self.luma.clone(),
                width: 4,
                height: 4,
                sequence,
                captured_at: Utc::now(),
            })
        }
    }

    #[derive(Default)]
    struct TestOracle {
        script: Mutex<VecDeque<Result<Option<Descriptor>, OracleError>>>,
        fallback: Option<Descriptor>,
        delay: Duration,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl TestOracle {
        fn always(descriptor: Option<Descriptor>) -> Self {
            Self { fallback: descriptor, ..Default::default() }
        }
    }

    impl DescriptorOracle for TestOracle {
        fn detect(&self, _frame: &Frame) -> Result<Option<Descriptor>, OracleError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let next = self.script.lock().unwrap().pop_front();
            self.active.fetch_sub(1, Ordering::SeqCst);
            next.unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    async fn seeded_store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        for (id, name, reference) in [("S-1", "Ada", [0.0, 0.0]), ("S-2", "Bo", [1.0, 1.0])] {
            store
                .create_student(NewStudent { id: id.into(), name: name.into(), email: None })
                .await
                .unwrap();
            store.set_reference_descriptor(&id.into(), &d(&reference)).await.unwrap();
        }
        for id in ["E1", "E2"] {
            store
                .create_event(NewEvent {
                    id: Some(id.into()),
                    name: format!("Lecture {id}"),
                    start_time: Utc::now() + ChronoDuration::hours(1),
                    description: None,
                })
                .await
                .unwrap();
        }
        store.set_active_event(&"E1".into()).await.unwrap();
        store
    }

    fn config() -> SessionConfig {
        SessionConfig {
            event_id: None,
            threshold: 0.6,
            tick_interval: Duration::from_millis(10),
            oracle_timeout: Duration::from_secs(2),
            low_light_threshold: 80.0,
        }
    }

    async fn next_report(rx: &mut broadcast::Receiver<TickReport>) -> TickReport {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no report within 5s")
            .expect("report channel closed")
    }

    #[tokio::test]
    async fn test_records_once_then_already_marked() {
        let store = seeded_store().await;
        let oracle = Arc::new(TestOracle::always(Some(d(&[0.1, 0.0]))));
        let session = Session::new(store.clone(), Arc::new(TestSource::endless()), oracle);
        let mut rx = session.subscribe();
        let handle = session.start(config()).await.unwrap();
        assert_eq!(handle.config().event_id, Some(EventId::from("E1")));

        match next_report(&mut rx).await.outcome {
            TickOutcome::Recorded { record, distance } => {
                assert_eq!(record.student_id.as_str(), "S-1");
                assert_eq!(record.event_id.as_str(), "E1");
                assert_eq!(record.status, AttendanceStatus::Present);
                assert!((record.confidence - 0.9).abs() < 1e-6);
                assert!((distance - 0.1).abs() < 1e-6);
            }
            other => panic!("expected Recorded, got {other:?}"),
        }
        for _ in 0..3 {
            let report = next_report(&mut rx).await;
            assert!(matches!(report.outcome, TickOutcome::AlreadyMarked { .. }));
        }

        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.recorded, 1);
        assert_eq!(store.attendance_by_event(&"E1".into()).await.unwrap().len(), 1);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_prior_attendance_is_not_duplicated() {
        let store = seeded_store().await;
        store
            .record_if_absent(RecordRequest {
                student_id: "S-1".into(),
                event_id: "E1".into(),
                confidence: 0.8,
                recognized_at: Utc::now(),
                event_start: Utc::now(),
            })
            .await
            .unwrap();
        let oracle = Arc::new(TestOracle::always(Some(d(&[0.0, 0.1]))));
        let session = Session::new(store.clone(), Arc::new(TestSource::endless()), oracle);
        let mut rx = session.subscribe();
        let handle = session.start(config()).await.unwrap();

        let report = next_report(&mut rx).await;
        assert!(matches!(report.outcome, TickOutcome::AlreadyMarked { .. }));
        handle.shutdown().await.unwrap();

        let records = store.attendance_by_event(&"E1".into()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!((records[0].confidence - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_no_active_event_blocks_start() {
        let store = seeded_store().await;
        store.clear_active_event().await.unwrap();
        let session = Session::new(
            store,
            Arc::new(TestSource::endless()),
            Arc::new(TestOracle::always(None)),
        );
        let err = session.start(config()).await.err().unwrap();
        assert!(matches!(err, SessionError::NoActiveEvent));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_unknown_event_rejected() {
        let session = Session::new(
            seeded_store().await,
            Arc::new(TestSource::endless()),
            Arc::new(TestOracle::always(None)),
        );
        let cfg = SessionConfig { event_id: Some("missing".into()), ..config() };
        let err = session.start(cfg).await.err().unwrap();
        assert!(matches!(err, SessionError::EventNotFound(_)));
    }

    #[tokio::test]
    async fn test_second_start_while_running() {
        let session = Session::new(
            seeded_store().await,
            Arc::new(TestSource::endless()),
            Arc::new(TestOracle::always(None)),
        );
        let handle = session.start(config()).await.unwrap();
        let err = session.start(config()).await.err().unwrap();
        assert!(matches!(err, SessionError::AlreadyRunning));
        handle.shutdown().await.unwrap();

        // Stopped sessions can be started again.
        let again = session.start(config()).await.unwrap();
        again.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_oracle_failure_is_transient() {
        let oracle = TestOracle {
            script: Mutex::new(VecDeque::from([
                Err(OracleError::DetectionFailed("model crashed".into())),
                Ok(Some(d(&[1.0, 0.9]))),
            ])),
            ..Default::default()
        };
        let session = Session::new(
            seeded_store().await,
            Arc::new(TestSource::endless()),
            Arc::new(oracle),
        );
        let mut rx = session.subscribe();
        let handle = session.start(config()).await.unwrap();

        assert!(matches!(next_report(&mut rx).await.outcome, TickOutcome::OracleFailed(_)));
        match next_report(&mut rx).await.outcome {
            TickOutcome::Recorded { record, .. } => assert_eq!(record.student_id.as_str(), "S-2"),
            other => panic!("expected Recorded, got {other:?}"),
        }
        assert_ne!(session.state(), SessionState::Stopped);
        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn test_no_face_and_unrecognized() {
        let oracle = TestOracle {
            script: Mutex::new(VecDeque::from([Ok(None), Ok(Some(d(&[5.0, 5.0])))])),
            ..Default::default()
        };
        let session = Session::new(
            seeded_store().await,
            Arc::new(TestSource::endless()),
            Arc::new(oracle),
        );
        let mut rx = session.subscribe();
        let handle = session.start(config()).await.unwrap();

        assert_eq!(next_report(&mut rx).await.outcome, TickOutcome::NoFace);
        match next_report(&mut rx).await.outcome {
            TickOutcome::Unrecognized { nearest } => {
                let nearest = nearest.unwrap();
                assert!((nearest - 32.0_f32.sqrt()).abs() < 1e-5);
            }
            other => panic!("expected Unrecognized, got {other:?}"),
        }
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .create_event(NewEvent {
                id: Some("E1".into()),
                name: "Lecture".into(),
                start_time: Utc::now(),
                description: None,
            })
            .await
            .unwrap();
        store.set_active_event(&"E1".into()).await.unwrap();
        let session = Session::new(
            store,
            Arc::new(TestSource::endless()),
            Arc::new(TestOracle::always(Some(d(&[0.0, 0.0])))),
        );
        let mut rx = session.subscribe();
        let handle = session.start(config()).await.unwrap();
        assert_eq!(next_report(&mut rx).await.outcome, TickOutcome::NoTrainedStudents);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_oracle_is_single_flight() {
        let oracle = Arc::new(TestOracle {
            delay: Duration::from_millis(60),
            ..Default::default()
        });
        let session = Session::new(
            seeded_store().await,
            Arc::new(TestSource::endless()),
            Arc::clone(&oracle),
        );
        let mut rx = session.subscribe();
        let cfg = SessionConfig { tick_interval: Duration::from_millis(5), ..config() };
        let handle = session.start(cfg).await.unwrap();

        for _ in 0..3 {
            assert_eq!(next_report(&mut rx).await.outcome, TickOutcome::NoFace);
        }
        let stats = handle.shutdown().await.unwrap();
        assert_eq!(oracle.max_active.load(Ordering::SeqCst), 1);
        assert!(stats.ticks_dropped > 0, "expected dropped ticks, got {stats:?}");
    }

    #[tokio::test]
    async fn test_timed_out_detection_is_awaited_not_overlapped() {
        let oracle = Arc::new(TestOracle {
            delay: Duration::from_millis(150),
            fallback: Some(d(&[0.0, 0.0])),
            ..Default::default()
        });
        let store = seeded_store().await;
        let session = Session::new(
            store.clone(),
            Arc::new(TestSource::endless()),
            Arc::clone(&oracle),
        );
        let mut rx = session.subscribe();
        let cfg = SessionConfig { oracle_timeout: Duration::from_millis(30), ..config() };
        let handle = session.start(cfg).await.unwrap();

        assert_eq!(next_report(&mut rx).await.outcome, TickOutcome::OracleTimedOut);
        assert_ne!(session.state(), SessionState::Stopped);
        // The slow answer still counts once it arrives.
        match next_report(&mut rx).await.outcome {
            TickOutcome::Recorded { record, .. } => assert_eq!(record.student_id.as_str(), "S-1"),
            other => panic!("expected Recorded, got {other:?}"),
        }
        assert_eq!(next_report(&mut rx).await.outcome, TickOutcome::OracleTimedOut);

        let stats = handle.shutdown().await.unwrap();
        assert_eq!(oracle.max_active.load(Ordering::SeqCst), 1);
        assert!(stats.ticks_dropped > 0, "expected dropped ticks, got {stats:?}");
        assert_eq!(store.attendance_by_event(&"E1".into()).await.unwrap().len(), 1);
    }

    struct DelayedReader {
        delay: Duration,
        waited: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for DelayedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.waited {
                std::thread::sleep(self.delay);
                self.waited = true;
            }
            self.inner.read(buf)
        }
    }

    #[tokio::test]
    async fn test_slow_feed_line_is_not_lost() {
        let reader = DelayedReader {
            delay: Duration::from_millis(200),
            waited: false,
            inner: Cursor::new(b"{\"descriptor\":[0.0,0.1]}\n".to_vec()),
        };
        let store = seeded_store().await;
        let session = Session::new(
            store.clone(),
            Arc::new(FeedSource::new(BufReader::new(reader))),
            Arc::new(FeedOracle::new(2)),
        );
        let mut rx = session.subscribe();
        let cfg = SessionConfig { oracle_timeout: Duration::from_millis(30), ..config() };
        let handle = session.start(cfg).await.unwrap();

        match next_report(&mut rx).await.outcome {
            TickOutcome::Recorded { record, .. } => assert_eq!(record.student_id.as_str(), "S-1"),
            other => panic!("expected Recorded, got {other:?}"),
        }
        assert_eq!(next_report(&mut rx).await.outcome, TickOutcome::FeedEnded);

        let stats = handle.join().await.unwrap();
        assert_eq!(stats.recorded, 1);
        assert_eq!(stats.failures, 0);
        assert_eq!(store.attendance_by_event(&"E1".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_tick_finish() {
        let oracle = TestOracle {
            delay: Duration::from_millis(100),
            fallback: Some(d(&[0.0, 0.0])),
            ..Default::default()
        };
        let store = seeded_store().await;
        let session = Session::new(store.clone(), Arc::new(TestSource::endless()), Arc::new(oracle));
        let mut rx = session.subscribe();
        let mut state = session.watch_state();
        let handle = session.start(config()).await.unwrap();

        state.wait_for(|s| *s == SessionState::Processing).await.unwrap();
        // Let the frame reach the oracle before stopping.
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop();
        let stats = handle.join().await.unwrap();

        assert_eq!(stats.ticks, 1);
        assert!(matches!(next_report(&mut rx).await.outcome, TickOutcome::Recorded { .. }));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(store.attendance_by_event(&"E1".into()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_switch_event_applies_on_next_tick() {
        let store = seeded_store().await;
        let session = Session::new(
            store.clone(),
            Arc::new(TestSource::endless()),
            Arc::new(TestOracle::always(Some(d(&[0.0, 0.0])))),
        );
        let mut rx = session.subscribe();
        let handle = session.start(config()).await.unwrap();

        let first = next_report(&mut rx).await;
        assert_eq!(first.event_id.as_str(), "E1");
        assert!(matches!(first.outcome, TickOutcome::Recorded { .. }));

        handle.switch_event("E2".into()).await.unwrap();
        loop {
            let report = next_report(&mut rx).await;
            if report.event_id.as_str() == "E2" {
                assert!(matches!(report.outcome, TickOutcome::Recorded { .. }));
                break;
            }
        }
        handle.shutdown().await.unwrap();

        let history = store.attendance_by_student(&"S-1".into()).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    /// Reports no face until a descriptor is handed to it.
    #[derive(Default)]
    struct HeldOracle {
        descriptor: Mutex<Option<Descriptor>>,
    }

    impl DescriptorOracle for HeldOracle {
        fn detect(&self, _frame: &Frame) -> Result<Option<Descriptor>, OracleError> {
            Ok(self.descriptor.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn test_edited_start_applies_to_later_sightings() {
        let store = seeded_store().await;
        let oracle = Arc::new(HeldOracle::default());
        let session = Session::new(
            store.clone(),
            Arc::new(TestSource::endless()),
            Arc::clone(&oracle),
        );
        let mut rx = session.subscribe();
        let handle = session.start(config()).await.unwrap();
        assert!(matches!(next_report(&mut rx).await.outcome, TickOutcome::NoFace));

        let update = EventUpdate {
            start_time: Some(Utc::now() - ChronoDuration::minutes(10)),
            ..Default::default()
        };
        store.update_event(&"E1".into(), update).await.unwrap();
        *oracle.descriptor.lock().unwrap() = Some(d(&[0.0, 0.0]));

        loop {
            match next_report(&mut rx).await.outcome {
                TickOutcome::NoFace => continue,
                TickOutcome::Recorded { record, .. } => {
                    assert_eq!(record.student_id.as_str(), "S-1");
                    assert_eq!(record.status, AttendanceStatus::Late);
                    break;
                }
                other => panic!("expected Recorded, got {other:?}"),
            }
        }
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_switch_to_unknown_event_rejected() {
        let session = Session::new(
            seeded_store().await,
            Arc::new(TestSource::endless()),
            Arc::new(TestOracle::always(None)),
        );
        let handle = session.start(config()).await.unwrap();
        let err = handle.switch_event("nope".into()).await.unwrap_err();
        assert!(matches!(err, SessionError::EventNotFound(_)));
        assert_eq!(handle.config().event_id, Some(EventId::from("E1")));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_feed_end_stops_session() {
        let source = TestSource { next: AtomicU64::new(0), limit: Some(2), luma: None };
        let session = Session::new(
            seeded_store().await,
            Arc::new(source),
            Arc::new(TestOracle::always(None)),
        );
        let mut rx = session.subscribe();
        let handle = session.start(config()).await.unwrap();

        assert_eq!(next_report(&mut rx).await.outcome, TickOutcome::NoFace);
        assert_eq!(next_report(&mut rx).await.outcome, TickOutcome::NoFace);
        assert_eq!(next_report(&mut rx).await.outcome, TickOutcome::FeedEnded);

        let stats = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.no_face, 2);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_low_light_observation() {
        let source = TestSource {
            next: AtomicU64::new(0),
            limit: None,
            luma: Some(vec![20u8; 16]),
        };
        let session = Session::new(
            seeded_store().await,
            Arc::new(source),
            Arc::new(TestOracle::always(None)),
        );
        let mut rx = session.subscribe();
        let handle = session.start(config()).await.unwrap();

        let report = next_report(&mut rx).await;
        assert_eq!(report.low_light, Some(true));
        assert_eq!(report.sequence, Some(0));
        handle.shutdown().await.unwrap();
    }
}
