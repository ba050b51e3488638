//! Synchronous core of the workout session.
//!
//! Every operation takes the current instant explicitly; the controller owns
//! the clock. Elapsed time is measured from a reference anchor that is shifted
//! forward on resume, so paused intervals never count toward any segment.
//! Preset phases are placed on that pause-excluded timeline at exact nominal
//! boundaries, so tick jitter cannot accumulate across phases.

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::SessionConfig,
    models::{Reading, SetKind, SetRecord, StoredSetRecord, TimerPreset, WorkoutSummary},
    telemetry::{heart_rate_recovery, rmssd_from_bpm, segment_stats, SampleStore, SegmentStats},
    zones::{Zone, ZoneConfiguration},
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Cooldown,
    CooldownPaused,
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Idle
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PresetPhase {
    Work,
    Rest,
    Cooldown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started,
    Paused,
    Resumed,
    RecordAdded(SetRecord),
    PhaseChanged { phase: PresetPhase, set_index: u32 },
    /// One-shot cue when a preset work set finishes.
    Cue { set_index: u32, audible: bool },
    CooldownStarted,
    CooldownToggled { paused: bool },
    Completed { heart_rate_recovery: Option<i32> },
    Reset,
}

/// Segment that has started but not been finalized. Becomes a record only
/// when it closes.
#[derive(Debug, Clone, Copy)]
struct OpenSegment {
    kind: SetKind,
    start_elapsed: Duration,
    start_at: Instant,
    /// Ordinal the work record will take, or the work set a rest follows.
    work_ordinal: u32,
}

#[derive(Debug, Clone, Copy)]
struct PresetProgress {
    phase: PresetPhase,
    set_index: u32,
    /// Phase start on the pause-excluded elapsed timeline.
    phase_start: Duration,
}

#[derive(Debug, Clone, Copy)]
struct CooldownClock {
    anchor: Instant,
    paused_at: Option<Instant>,
    start_reading: Option<Reading>,
    last_reading: Option<Reading>,
    checkpoints: u32,
    last_boundary: Duration,
    /// Real instant the current checkpoint window opened. Not shifted by
    /// cooldown pauses, unlike `anchor`.
    segment_start_at: Instant,
}

impl CooldownClock {
    fn elapsed(&self, now: Instant) -> Duration {
        self.paused_at
            .unwrap_or(now)
            .saturating_duration_since(self.anchor)
    }
}

/// Read-only view handed to presentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub current_bpm: Option<u16>,
    pub current_zone: Option<Zone>,
    pub elapsed: Duration,
    pub segment_elapsed: Duration,
    pub open_segment: Option<SetKind>,
    pub segment_stats: SegmentStats,
    pub cooldown_elapsed: Option<Duration>,
    pub cooldown_remaining: Option<Duration>,
    pub records: Vec<SetRecord>,
    pub preset_name: Option<String>,
    pub preset_phase: Option<PresetPhase>,
    pub preset_set: Option<u32>,
    pub phase_remaining: Option<Duration>,
    pub time_in_zones: Option<[Duration; 5]>,
    pub completed: bool,
    pub heart_rate_recovery: Option<i32>,
}

#[derive(Debug)]
pub struct SessionState {
    config: SessionConfig,
    status: SessionStatus,
    anchor: Option<Instant>,
    paused_at: Option<Instant>,
    frozen_elapsed: Duration,
    open: Option<OpenSegment>,
    preset: Option<TimerPreset>,
    progress: Option<PresetProgress>,
    cooldown: Option<CooldownClock>,
    zones: Option<ZoneConfiguration>,
    records: Vec<SetRecord>,
    work_count: u32,
    samples: SampleStore,
    completed: bool,
    heart_rate_recovery: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    current_bpm: Option<u16>,
    events: Vec<SessionEvent>,
}

impl SessionState {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            status: SessionStatus::Idle,
            anchor: None,
            paused_at: None,
            frozen_elapsed: Duration::ZERO,
            open: None,
            preset: None,
            progress: None,
            cooldown: None,
            zones: None,
            records: Vec::new(),
            work_count: 0,
            samples: SampleStore::new(),
            completed: false,
            heart_rate_recovery: None,
            started_at: None,
            completed_at: None,
            current_bpm: None,
            events: Vec::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn records(&self) -> &[SetRecord] {
        &self.records
    }

    pub fn preset(&self) -> Option<&TimerPreset> {
        self.preset.as_ref()
    }

    pub fn samples(&self) -> &SampleStore {
        &self.samples
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn heart_rate_recovery(&self) -> Option<i32> {
        self.heart_rate_recovery
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Pause-excluded session time. Frozen outside `Running`.
    pub fn elapsed(&self, now: Instant) -> Duration {
        match (self.status, self.anchor) {
            (SessionStatus::Running, Some(anchor)) => now.saturating_duration_since(anchor),
            _ => self.frozen_elapsed,
        }
    }

    pub fn segment_elapsed(&self, now: Instant) -> Duration {
        self.open
            .map(|open| self.elapsed(now).saturating_sub(open.start_elapsed))
            .unwrap_or_default()
    }

    /// Time left in the current preset phase.
    pub fn phase_remaining(&self, now: Instant) -> Option<Duration> {
        let progress = self.progress?;
        match progress.phase {
            PresetPhase::Cooldown => self
                .cooldown
                .map(|clock| self.config.cooldown().saturating_sub(clock.elapsed(now))),
            phase => {
                let boundary = progress.phase_start + self.nominal(phase)?;
                Some(boundary.saturating_sub(self.elapsed(now)))
            }
        }
    }

    pub fn load_preset(&mut self, preset: TimerPreset) -> Result<()> {
        if self.status != SessionStatus::Idle {
            bail!("presets can only be loaded while idle");
        }
        preset.validate()?;
        self.preset = Some(preset);
        Ok(())
    }

    pub fn clear_preset(&mut self) -> Result<()> {
        if self.status != SessionStatus::Idle {
            bail!("presets can only be cleared while idle");
        }
        self.preset = None;
        self.progress = None;
        Ok(())
    }

    pub fn load_zones(&mut self, zones: Option<ZoneConfiguration>) {
        self.zones = zones;
    }

    pub fn start(&mut self, now: Instant) -> Result<()> {
        match self.status {
            SessionStatus::Idle => {
                self.begin(now);
                Ok(())
            }
            SessionStatus::Paused => {
                let (anchor, paused_at) = self
                    .anchor
                    .zip(self.paused_at)
                    .ok_or_else(|| anyhow!("paused session has no clock"))?;
                self.anchor = Some(anchor + now.saturating_duration_since(paused_at));
                self.paused_at = None;
                self.status = SessionStatus::Running;
                self.events.push(SessionEvent::Resumed);
                Ok(())
            }
            other => bail!("cannot start a session from {:?}", other),
        }
    }

    pub fn pause(&mut self, now: Instant, reading: Option<Reading>) -> Result<()> {
        if self.status != SessionStatus::Running {
            bail!("only a running session can be paused");
        }
        // Settle any phase boundary already crossed before freezing.
        self.advance_preset(now, reading);
        if self.status != SessionStatus::Running {
            return Ok(());
        }
        self.frozen_elapsed = self.elapsed(now);
        self.paused_at = Some(now);
        self.status = SessionStatus::Paused;
        self.events.push(SessionEvent::Paused);
        Ok(())
    }

    pub fn capture_work_set(&mut self, now: Instant, reading: Option<Reading>) -> Result<()> {
        self.ensure_manual_capture()?;
        let end = self.elapsed(now);
        let end_at = self.wall_at(end, now);
        self.close_segment(end, end_at, reading, true);
        self.open_segment(SetKind::Work, end, end_at);
        Ok(())
    }

    /// Closes the work segment and opens a rest. No-op while a rest is open.
    pub fn capture_rest_set(&mut self, now: Instant, reading: Option<Reading>) -> Result<()> {
        self.ensure_manual_capture()?;
        if self.open.is_some_and(|open| open.kind == SetKind::Rest) {
            return Ok(());
        }
        let end = self.elapsed(now);
        let end_at = self.wall_at(end, now);
        self.close_segment(end, end_at, reading, true);
        self.open_segment(SetKind::Rest, end, end_at);
        Ok(())
    }

    pub fn end(&mut self, now: Instant, reading: Option<Reading>) -> Result<()> {
        if !matches!(self.status, SessionStatus::Running | SessionStatus::Paused) {
            bail!("only an active session can be ended");
        }
        if self.status == SessionStatus::Running {
            self.advance_preset(now, reading);
            if !matches!(self.status, SessionStatus::Running) {
                return Ok(());
            }
        }
        let end = self.elapsed(now);
        let end_at = self.wall_at(end, now);
        self.close_segment(end, end_at, reading, false);
        self.enter_cooldown(end, now, reading);
        self.advance_cooldown(now, reading);
        Ok(())
    }

    pub fn toggle_cooldown(&mut self, now: Instant, reading: Option<Reading>) -> Result<()> {
        match self.status {
            SessionStatus::Cooldown => {
                self.advance_cooldown(now, reading);
                if self.status != SessionStatus::Cooldown {
                    return Ok(());
                }
                if let Some(clock) = self.cooldown.as_mut() {
                    clock.paused_at = Some(now);
                }
                self.status = SessionStatus::CooldownPaused;
                self.events.push(SessionEvent::CooldownToggled { paused: true });
                Ok(())
            }
            SessionStatus::CooldownPaused => {
                if let Some(clock) = self.cooldown.as_mut() {
                    if let Some(paused_at) = clock.paused_at.take() {
                        clock.anchor += now.saturating_duration_since(paused_at);
                    }
                }
                self.status = SessionStatus::Cooldown;
                self.events.push(SessionEvent::CooldownToggled { paused: false });
                Ok(())
            }
            other => bail!("no cooldown to toggle in {:?}", other),
        }
    }

    pub fn stop_and_complete(&mut self, now: Instant, reading: Option<Reading>) -> Result<()> {
        if !matches!(self.status, SessionStatus::Running | SessionStatus::Paused) {
            bail!("only an active session can be stopped");
        }
        if self.status == SessionStatus::Running {
            self.advance_preset(now, reading);
            if self.status != SessionStatus::Running {
                return Ok(());
            }
        }
        let end = self.elapsed(now);
        let end_at = self.wall_at(end, now);
        self.close_segment(end, end_at, reading, false);
        self.frozen_elapsed = end;
        self.complete(None);
        Ok(())
    }

    pub fn stop_cooldown_and_complete(
        &mut self,
        now: Instant,
        reading: Option<Reading>,
    ) -> Result<()> {
        if !matches!(
            self.status,
            SessionStatus::Cooldown | SessionStatus::CooldownPaused
        ) {
            bail!("no cooldown in progress");
        }
        self.advance_cooldown(now, reading);
        if self.status == SessionStatus::Idle {
            return Ok(());
        }
        if let Some(clock) = self.cooldown {
            let elapsed = clock.elapsed(now);
            if elapsed > clock.last_boundary {
                self.take_checkpoint(elapsed, reading);
            }
        }
        self.finish_cooldown(now);
        Ok(())
    }

    /// Unconditional return to `Idle`, dropping all session data and the preset.
    pub fn reset(&mut self) {
        self.clear_session_data();
        self.preset = None;
        self.status = SessionStatus::Idle;
        self.events.push(SessionEvent::Reset);
    }

    /// Phase and cooldown evaluation. Called by the 10 Hz ticker.
    pub fn tick(&mut self, now: Instant, reading: Option<Reading>) {
        self.current_bpm = reading.map(|r| r.value);
        match self.status {
            SessionStatus::Running => self.advance_preset(now, reading),
            SessionStatus::Cooldown => self.advance_cooldown(now, reading),
            _ => {}
        }
    }

    /// Appends a session sample stamped at `now`. Sampling is frozen while
    /// paused or idle. Returns whether the sample was stored.
    pub fn record_sample(&mut self, now: Instant, reading: Option<Reading>) -> bool {
        let offset = match self.status {
            SessionStatus::Running => self.elapsed(now),
            SessionStatus::Cooldown => {
                self.frozen_elapsed + self.cooldown.map(|c| c.elapsed(now)).unwrap_or_default()
            }
            _ => return false,
        };
        let Some(reading) = reading else {
            return false;
        };
        self.current_bpm = Some(reading.value);
        self.samples
            .push(reading.restamped(now).at_session_time(offset))
    }

    pub fn snapshot(&self, now: Instant) -> SessionSnapshot {
        let elapsed = self.elapsed(now);
        let (open_segment, segment_elapsed, segment_stats) = match self.open {
            Some(open) => {
                let end_at = self.wall_at(elapsed, now);
                (
                    Some(open.kind),
                    elapsed.saturating_sub(open.start_elapsed),
                    segment_stats(self.samples.window(open.start_at, end_at), None),
                )
            }
            None => (None, Duration::ZERO, SegmentStats::default()),
        };
        let cooldown_elapsed = self.cooldown.map(|clock| clock.elapsed(now));

        SessionSnapshot {
            status: self.status,
            current_bpm: self.current_bpm,
            current_zone: self
                .zones
                .as_ref()
                .zip(self.current_bpm)
                .and_then(|(zones, bpm)| zones.classify(bpm)),
            elapsed,
            segment_elapsed,
            open_segment,
            segment_stats,
            cooldown_elapsed,
            cooldown_remaining: cooldown_elapsed
                .map(|e| self.config.cooldown().saturating_sub(e)),
            records: self.records.clone(),
            preset_name: self.preset.as_ref().map(|p| p.name.clone()),
            preset_phase: self.progress.map(|p| p.phase),
            preset_set: self.progress.map(|p| p.set_index),
            phase_remaining: self.phase_remaining(now),
            time_in_zones: self.zones.as_ref().map(|zones| {
                zones.time_in_zones(self.samples.iter(), self.config.sample_interval())
            }),
            completed: self.completed,
            heart_rate_recovery: self.heart_rate_recovery,
        }
    }

    /// History entry for a completed session.
    pub fn summary(&self) -> Option<WorkoutSummary> {
        if !self.completed {
            return None;
        }
        let overall = segment_stats(self.samples.iter(), None);
        Some(WorkoutSummary {
            id: Uuid::new_v4().to_string(),
            started_at: self.started_at?,
            completed_at: self.completed_at?,
            preset_name: self.preset.as_ref().map(|p| p.name.clone()),
            total_elapsed_ms: self.frozen_elapsed.as_millis() as u64,
            heart_rate_recovery: self.heart_rate_recovery,
            avg_bpm: overall.avg,
            max_bpm: overall.max,
            min_bpm: overall.min,
            rmssd_ms: rmssd_from_bpm(&self.samples.values()),
            records: self.records.iter().map(StoredSetRecord::from).collect(),
        })
    }

    fn begin(&mut self, now: Instant) {
        self.clear_session_data();
        self.status = SessionStatus::Running;
        self.anchor = Some(now);
        self.started_at = Some(Utc::now());
        self.open_segment(SetKind::Work, Duration::ZERO, now);
        self.events.push(SessionEvent::Started);
        if self.preset.is_some() {
            self.set_phase(PresetPhase::Work, 1, Duration::ZERO);
        }
    }

    fn clear_session_data(&mut self) {
        self.anchor = None;
        self.paused_at = None;
        self.frozen_elapsed = Duration::ZERO;
        self.open = None;
        self.progress = None;
        self.cooldown = None;
        self.records.clear();
        self.work_count = 0;
        self.samples.clear();
        self.completed = false;
        self.heart_rate_recovery = None;
        self.started_at = None;
        self.completed_at = None;
        self.current_bpm = None;
    }

    fn ensure_manual_capture(&self) -> Result<()> {
        if !matches!(self.status, SessionStatus::Running | SessionStatus::Paused) {
            bail!("sets can only be captured during an active session");
        }
        if self.progress.is_some() {
            bail!("manual captures are disabled while a preset is running");
        }
        Ok(())
    }

    /// Instant at which the session clock read `elapsed` within the current
    /// run window.
    fn wall_at(&self, elapsed: Duration, now: Instant) -> Instant {
        self.anchor.map_or(now, |anchor| anchor + elapsed)
    }

    fn nominal(&self, phase: PresetPhase) -> Option<Duration> {
        let preset = self.preset.as_ref()?;
        match phase {
            PresetPhase::Work => Some(preset.work_duration()),
            PresetPhase::Rest => Some(preset.rest_duration()),
            PresetPhase::Cooldown => None,
        }
    }

    fn representative(&self, reading: Option<Reading>, at: Duration) -> Option<Reading> {
        reading
            .filter(|r| r.has_pulse() || self.config.zero_counts_as_representative)
            .map(|r| r.at_session_time(at))
    }

    fn open_segment(&mut self, kind: SetKind, start_elapsed: Duration, start_at: Instant) {
        let work_ordinal = match kind {
            SetKind::Work => self.work_count + 1,
            _ => self.work_count,
        };
        self.open = Some(OpenSegment {
            kind,
            start_elapsed,
            start_at,
            work_ordinal,
        });
    }

    /// Finalizes the open segment at `end`. Empty segments are dropped unless
    /// `keep_empty` is set (explicit captures keep them).
    fn close_segment(
        &mut self,
        end: Duration,
        end_at: Instant,
        reading: Option<Reading>,
        keep_empty: bool,
    ) {
        let Some(open) = self.open.take() else {
            return;
        };
        let segment_duration = end.saturating_sub(open.start_elapsed);
        if segment_duration.is_zero() && !keep_empty {
            return;
        }
        if open.kind == SetKind::Work {
            self.work_count = open.work_ordinal;
        }
        let stats = segment_stats(self.samples.window(open.start_at, end_at), reading.as_ref());
        let record = SetRecord {
            ordinal: open.work_ordinal,
            kind: open.kind,
            segment_duration,
            cumulative_duration: end,
            representative_reading: self.representative(reading, end),
            associated_work_ordinal: (open.kind == SetKind::Rest).then_some(open.work_ordinal),
            stats,
        };
        self.push_record(record);
    }

    fn push_record(&mut self, record: SetRecord) {
        self.events.push(SessionEvent::RecordAdded(record.clone()));
        self.records.push(record);
    }

    fn set_phase(&mut self, phase: PresetPhase, set_index: u32, phase_start: Duration) {
        self.progress = Some(PresetProgress {
            phase,
            set_index,
            phase_start,
        });
        self.events
            .push(SessionEvent::PhaseChanged { phase, set_index });
    }

    fn advance_preset(&mut self, now: Instant, reading: Option<Reading>) {
        let Some((set_count, rest, include_cooldown, audible)) = self.preset.as_ref().map(|p| {
            (p.set_count, p.rest_duration(), p.include_cooldown, p.play_sound)
        }) else {
            return;
        };

        while self.status == SessionStatus::Running {
            let Some(progress) = self.progress else {
                return;
            };
            let Some(nominal) = self.nominal(progress.phase) else {
                return;
            };
            let boundary = progress.phase_start + nominal;
            if self.elapsed(now) < boundary {
                return;
            }

            // The next phase starts at the exact boundary, never at `now`.
            let boundary_at = self.wall_at(boundary, now);
            self.close_segment(boundary, boundary_at, reading, true);
            if progress.phase == PresetPhase::Work {
                self.events.push(SessionEvent::Cue {
                    set_index: progress.set_index,
                    audible,
                });
            }

            match progress.phase {
                PresetPhase::Work if progress.set_index >= set_count => {
                    if include_cooldown {
                        self.enter_cooldown(boundary, boundary_at, reading);
                        self.advance_cooldown(now, reading);
                    } else {
                        self.frozen_elapsed = boundary;
                        self.complete(None);
                    }
                }
                PresetPhase::Work if rest.is_zero() => {
                    self.set_phase(PresetPhase::Work, progress.set_index + 1, boundary);
                    self.open_segment(SetKind::Work, boundary, boundary_at);
                }
                PresetPhase::Work => {
                    self.set_phase(PresetPhase::Rest, progress.set_index, boundary);
                    self.open_segment(SetKind::Rest, boundary, boundary_at);
                }
                PresetPhase::Rest => {
                    self.set_phase(PresetPhase::Work, progress.set_index + 1, boundary);
                    self.open_segment(SetKind::Work, boundary, boundary_at);
                }
                PresetPhase::Cooldown => return,
            }
        }
    }

    fn enter_cooldown(&mut self, total: Duration, at: Instant, reading: Option<Reading>) {
        self.frozen_elapsed = total;
        self.paused_at = None;
        self.open = None;
        self.status = SessionStatus::Cooldown;
        if let Some(progress) = self.progress {
            self.set_phase(PresetPhase::Cooldown, progress.set_index, total);
        }
        self.cooldown = Some(CooldownClock {
            anchor: at,
            paused_at: None,
            start_reading: reading,
            last_reading: None,
            checkpoints: 0,
            last_boundary: Duration::ZERO,
            segment_start_at: at,
        });
        self.events.push(SessionEvent::CooldownStarted);
    }

    fn advance_cooldown(&mut self, now: Instant, reading: Option<Reading>) {
        let total = self.config.cooldown();
        let interval = self.config.cooldown_checkpoint();
        while self.status == SessionStatus::Cooldown {
            let Some(clock) = self.cooldown else {
                return;
            };
            let elapsed = clock.elapsed(now);
            // An interval too large to multiply has no further checkpoint.
            let next = clock
                .checkpoints
                .checked_add(1)
                .and_then(|n| interval.checked_mul(n))
                .filter(|next| *next <= total);
            if let Some(next) = next.filter(|next| elapsed >= *next) {
                self.take_checkpoint(next, reading);
                continue;
            }
            if elapsed < total {
                return;
            }
            if clock.last_boundary < total {
                self.take_checkpoint(total, reading);
            }
            self.finish_cooldown(now);
        }
    }

    fn take_checkpoint(&mut self, boundary: Duration, reading: Option<Reading>) {
        let Some(mut clock) = self.cooldown else {
            return;
        };
        let start_at = clock.segment_start_at;
        let end_at = clock.anchor + boundary;
        let cumulative = self.frozen_elapsed + boundary;
        clock.checkpoints += 1;

        let record = SetRecord {
            ordinal: clock.checkpoints,
            kind: SetKind::Cooldown,
            segment_duration: boundary.saturating_sub(clock.last_boundary),
            cumulative_duration: cumulative,
            representative_reading: self.representative(reading, cumulative),
            associated_work_ordinal: None,
            stats: segment_stats(self.samples.window(start_at, end_at), reading.as_ref()),
        };

        clock.last_boundary = boundary;
        clock.segment_start_at = end_at;
        clock.last_reading = reading;
        self.cooldown = Some(clock);
        self.push_record(record);
    }

    fn finish_cooldown(&mut self, now: Instant) {
        let mut recovery = None;
        if let Some(clock) = self.cooldown.as_mut() {
            let frozen_at = clock.anchor + clock.elapsed(now).min(self.config.cooldown());
            clock.paused_at = Some(frozen_at);
            recovery = heart_rate_recovery(clock.start_reading.as_ref(), clock.last_reading.as_ref());
        }
        self.complete(recovery);
    }

    fn complete(&mut self, recovery: Option<i32>) {
        self.status = SessionStatus::Idle;
        self.open = None;
        self.paused_at = None;
        self.progress = None;
        self.completed = true;
        self.heart_rate_recovery = recovery;
        self.completed_at = Some(Utc::now());
        self.events.push(SessionEvent::Completed {
            heart_rate_recovery: recovery,
        });
    }
}
