use std::{
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use anyhow::Result;
use log::error;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{debug_mode, SessionConfig},
    db::Database,
    models::{no_reading_source, Reading, ReadingSource, TimerPreset, WorkoutSummary},
    zones::ZoneConfiguration,
};

use super::{
    cue::CueSink,
    state::{SessionEvent, SessionSnapshot, SessionState, SessionStatus},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

/// Monotonic "now" that follows tokio's clock, so paused-time tests drive the
/// session deterministically.
fn clock_now() -> Instant {
    time::Instant::now().into_std()
}

struct Tickers {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Tickers {
    fn stop(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

/// State shared by API calls and the ticker task.
struct Shared {
    state: Mutex<SessionState>,
    source: RwLock<ReadingSource>,
    cue: Arc<dyn CueSink>,
    history: Option<Database>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
}

/// What a single mutation produced, collected under the state lock and
/// published after it is released.
struct Outcome {
    events: Vec<SessionEvent>,
    snapshot: SessionSnapshot,
    summary: Option<WorkoutSummary>,
}

impl Shared {
    fn current_reading(&self) -> Option<Reading> {
        let source = match self.source.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        source()
    }

    fn collect(state: &mut SessionState, now: Instant) -> Outcome {
        let events = state.drain_events();
        let completed = events
            .iter()
            .any(|event| matches!(event, SessionEvent::Completed { .. }));
        Outcome {
            snapshot: state.snapshot(now),
            summary: if completed { state.summary() } else { None },
            events,
        }
    }

    async fn publish(&self, outcome: Outcome) {
        for event in outcome.events {
            if let SessionEvent::Cue { set_index, audible } = event {
                self.cue.cue(set_index, audible);
            }
            let _ = self.events_tx.send(event);
        }
        self.snapshot_tx.send_replace(outcome.snapshot);

        if let Some(summary) = outcome.summary {
            log_info!(
                "Workout complete: {} records, {} ms",
                summary.records.len(),
                summary.total_elapsed_ms
            );
            if let Some(db) = &self.history {
                if let Err(err) = db.insert_workout(&summary).await {
                    error!("Failed to persist workout {}: {err:#}", summary.id);
                }
            }
        }
    }

    /// One ticker step. Returns whether the tickers should keep running.
    async fn step(&self, sample: bool) -> bool {
        let reading = self.current_reading();
        let (outcome, status) = {
            let mut state = self.state.lock().await;
            let now = clock_now();
            if sample {
                state.record_sample(now, reading);
            } else {
                state.tick(now, reading);
            }
            (Self::collect(&mut state, now), state.status())
        };
        self.publish(outcome).await;
        matches!(status, SessionStatus::Running | SessionStatus::Cooldown)
    }
}

/// Async driver around [`SessionState`]: supplies the clock and the current
/// reading, runs the 10 Hz phase ticker and 1 Hz sampler, and publishes
/// snapshots and events.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
    tickers: Arc<Mutex<Option<Tickers>>>,
    tick_interval: Duration,
    sample_interval: Duration,
    log_every_ticks: u32,
}

impl SessionController {
    pub fn new(config: SessionConfig, cue: Arc<dyn CueSink>, history: Option<Database>) -> Self {
        let tick_interval = config.tick_interval();
        let sample_interval = config.sample_interval();
        let state = SessionState::new(config);
        let (snapshot_tx, _) = watch::channel(state.snapshot(clock_now()));
        let (events_tx, _) = broadcast::channel(128);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                source: RwLock::new(no_reading_source()),
                cue,
                history,
                snapshot_tx,
                events_tx,
            }),
            tickers: Arc::new(Mutex::new(None)),
            tick_interval,
            sample_interval,
            log_every_ticks: if debug_mode() { 1 } else { 50 },
        }
    }

    /// Switches the feed the session reads from (local sensor or remote
    /// viewer).
    pub fn set_reading_source(&self, source: ReadingSource) {
        let mut guard = match self.shared.source.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = source;
    }

    pub fn current_reading(&self) -> Option<Reading> {
        self.shared.current_reading()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.shared.state.lock().await.snapshot(clock_now())
    }

    pub async fn load_zones(&self, zones: Option<ZoneConfiguration>) -> Result<()> {
        self.apply(move |state, _, _| {
            state.load_zones(zones);
            Ok(())
        })
        .await
    }

    pub async fn load_preset(&self, preset: TimerPreset) -> Result<()> {
        self.apply(move |state, _, _| state.load_preset(preset)).await
    }

    pub async fn clear_preset(&self) -> Result<()> {
        self.apply(|state, _, _| state.clear_preset()).await
    }

    pub async fn start(&self) -> Result<()> {
        self.apply(|state, now, _| state.start(now)).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.apply(|state, now, reading| state.pause(now, reading))
            .await
    }

    /// Alias for [`pause`](Self::pause); no segment is finalized.
    pub async fn stop(&self) -> Result<()> {
        self.pause().await
    }

    pub async fn capture_work_set(&self) -> Result<()> {
        self.apply(|state, now, reading| state.capture_work_set(now, reading))
            .await
    }

    pub async fn capture_rest_set(&self) -> Result<()> {
        self.apply(|state, now, reading| state.capture_rest_set(now, reading))
            .await
    }

    pub async fn end(&self) -> Result<()> {
        self.apply(|state, now, reading| state.end(now, reading))
            .await
    }

    pub async fn toggle_cooldown(&self) -> Result<()> {
        self.apply(|state, now, reading| state.toggle_cooldown(now, reading))
            .await
    }

    pub async fn stop_and_complete(&self) -> Result<()> {
        self.apply(|state, now, reading| state.stop_and_complete(now, reading))
            .await
    }

    pub async fn stop_cooldown_and_complete(&self) -> Result<()> {
        self.apply(|state, now, reading| state.stop_cooldown_and_complete(now, reading))
            .await
    }

    pub async fn reset(&self) -> Result<()> {
        self.apply(|state, _, _| {
            state.reset();
            Ok(())
        })
        .await
    }

    /// Cancels the tickers. The session state is left as is.
    pub async fn shutdown(&self) {
        if let Some(tickers) = self.tickers.lock().await.take() {
            tickers.stop();
        }
    }

    async fn apply<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(&mut SessionState, Instant, Option<Reading>) -> Result<()>,
    {
        let reading = self.shared.current_reading();
        let (outcome, status) = {
            let mut state = self.shared.state.lock().await;
            let now = clock_now();
            op(&mut state, now, reading)?;
            (Shared::collect(&mut state, now), state.status())
        };

        self.shared.publish(outcome).await;
        self.sync_tickers(status).await;
        Ok(())
    }

    /// Tickers run only in `Running` and `Cooldown`; every other state
    /// cancels them.
    async fn sync_tickers(&self, status: SessionStatus) {
        let mut guard = self.tickers.lock().await;
        let active = matches!(status, SessionStatus::Running | SessionStatus::Cooldown);

        if !active {
            if let Some(tickers) = guard.take() {
                tickers.stop();
                log_debug!("Session tickers stopped ({:?})", status);
            }
            return;
        }

        if guard
            .as_ref()
            .is_some_and(|tickers| !tickers.handle.is_finished())
        {
            return;
        }
        *guard = Some(self.spawn_tickers());
    }

    fn spawn_tickers(&self) -> Tickers {
        let cancel = CancellationToken::new();
        let shared = self.shared.clone();
        let token = cancel.clone();
        let tick_interval = self.tick_interval;
        let sample_interval = self.sample_interval;
        let log_every = self.log_every_ticks;

        let handle = tokio::spawn(async move {
            let mut tick = time::interval(tick_interval);
            let mut sample = time::interval(sample_interval);
            let mut ticks: u32 = 0;

            loop {
                let keep_running = tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        ticks = ticks.wrapping_add(1);
                        if ticks % log_every == 0 {
                            let snapshot = shared.snapshot_tx.borrow().clone();
                            log_debug!(
                                "tick {:?} elapsed={:?} segment={:?} bpm={:?}",
                                snapshot.status,
                                snapshot.elapsed,
                                snapshot.segment_elapsed,
                                snapshot.current_bpm
                            );
                        }
                        shared.step(false).await
                    }
                    _ = sample.tick() => shared.step(true).await,
                };
                if !keep_running {
                    break;
                }
            }
            log_debug!("Session ticker exiting");
        });

        Tickers { cancel, handle }
    }
}

#[cfg(test)]
mod tests {
    use crate::models::{fixed_reading_source, SetKind};
    use crate::session::cue::RecordingCueSink;

    use super::*;

    fn controller(cue: Arc<RecordingCueSink>, history: Option<Database>) -> SessionController {
        let controller = SessionController::new(SessionConfig::default(), cue, history);
        controller.set_reading_source(fixed_reading_source(132));
        controller
    }

    #[tokio::test(start_paused = true)]
    async fn preset_runs_to_completion_on_its_own() {
        let cue = Arc::new(RecordingCueSink::default());
        let db = Database::open_in_memory().unwrap();
        let controller = controller(cue.clone(), Some(db.clone()));
        let mut events = controller.subscribe_events();

        controller
            .load_preset(TimerPreset::new(
                "short",
                Duration::from_secs(5),
                Duration::from_secs(3),
                2,
            ))
            .await
            .unwrap();
        controller.start().await.unwrap();
        time::sleep(Duration::from_millis(13_200)).await;

        let snapshot = controller.snapshot().await;
        assert!(snapshot.completed);
        assert_eq!(snapshot.status, SessionStatus::Idle);
        let kinds: Vec<SetKind> = snapshot.records.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![SetKind::Work, SetKind::Rest, SetKind::Work]);
        assert_eq!(snapshot.records[0].segment_duration, Duration::from_secs(5));
        assert_eq!(snapshot.records[2].cumulative_duration, Duration::from_secs(13));
        assert_eq!(cue.cues(), vec![(1, true), (2, true)]);

        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            completed |= matches!(event, SessionEvent::Completed { .. });
        }
        assert!(completed);

        let history = db.list_workouts(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].preset_name.as_deref(), Some("short"));
        assert_eq!(history[0].records.len(), 3);
        assert_eq!(history[0].max_bpm, Some(132));
    }

    #[tokio::test(start_paused = true)]
    async fn pausing_stops_the_clock_and_the_sampler() {
        let cue = Arc::new(RecordingCueSink::default());
        let controller = controller(cue, None);

        controller.start().await.unwrap();
        time::sleep(Duration::from_millis(3_500)).await;
        controller.pause().await.unwrap();
        let paused = controller.snapshot().await;
        time::sleep(Duration::from_secs(30)).await;

        let later = controller.snapshot().await;
        assert_eq!(later.elapsed, Duration::from_millis(3_500));
        assert_eq!(later.status, SessionStatus::Paused);
        assert_eq!(paused, later);

        controller.start().await.unwrap();
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(controller.snapshot().await.elapsed, Duration::from_millis(5_500));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_watch_follows_reading_source() {
        let cue = Arc::new(RecordingCueSink::default());
        let controller = controller(cue, None);
        let mut snapshots = controller.watch_snapshot();

        controller.start().await.unwrap();
        time::sleep(Duration::from_millis(1_050)).await;
        assert_eq!(snapshots.borrow_and_update().current_bpm, Some(132));

        controller.set_reading_source(fixed_reading_source(97));
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(snapshots.borrow_and_update().current_bpm, Some(97));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_session_with_cooldown_records_recovery() {
        let cue = Arc::new(RecordingCueSink::default());
        let db = Database::open_in_memory().unwrap();
        let controller = controller(cue, Some(db.clone()));

        controller.start().await.unwrap();
        time::sleep(Duration::from_secs(20)).await;
        controller.capture_rest_set().await.unwrap();
        time::sleep(Duration::from_secs(10)).await;
        controller.capture_work_set().await.unwrap();
        time::sleep(Duration::from_secs(15)).await;

        controller.set_reading_source(fixed_reading_source(170));
        controller.end().await.unwrap();
        assert_eq!(controller.snapshot().await.status, SessionStatus::Cooldown);

        controller.set_reading_source(fixed_reading_source(128));
        time::sleep(Duration::from_millis(120_200)).await;

        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.status, SessionStatus::Idle);
        assert_eq!(snapshot.heart_rate_recovery, Some(42));
        let labels: Vec<String> = snapshot.records.iter().map(|r| r.label()).collect();
        assert_eq!(labels, vec!["1", "1R", "2", "C1", "C2"]);

        let history = db.list_workouts(10).await.unwrap();
        assert_eq!(history[0].heart_rate_recovery, Some(42));
        assert_eq!(history[0].total_elapsed_ms, 45_000);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_tickers_and_clears_state() {
        let cue = Arc::new(RecordingCueSink::default());
        let controller = controller(cue, None);

        controller.start().await.unwrap();
        time::sleep(Duration::from_secs(3)).await;
        controller.reset().await.unwrap();
        time::sleep(Duration::from_secs(3)).await;

        let snapshot = controller.snapshot().await;
        assert_eq!(snapshot.status, SessionStatus::Idle);
        assert_eq!(snapshot.elapsed, Duration::ZERO);
        assert!(snapshot.records.is_empty());
        assert!(controller.tickers.lock().await.is_none());
        assert!(controller.pause().await.is_err());
    }
}
