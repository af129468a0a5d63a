//! Real-time execution of a [`Timeline`] against the home hub.
//!
//! A single ticker advances a pausable clock and walks per-track cursors
//! through a lookahead window. Due commands go into a bounded queue per
//! device; each queue is drained by its own task so a slow light never
//! holds up the others.

mod lane;

use std::{
    collections::HashMap,
    ops::ControlFlow,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{mpsc, Semaphore},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::PlaybackConfig, hub::HomeHub, scanner::CapabilitySet, ticker::PeriodicTicker,
    timeline::Timeline, LightSyncError, Result,
};

use lane::{Lane, Queued};

/// Monotonic playback position that can be frozen and moved.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    base_seconds: f64,
    anchor: Option<Instant>,
}

impl PlaybackClock {
    /// A paused clock at `position` seconds.
    pub fn new(position: f64) -> Self {
        Self {
            base_seconds: position.max(0.0),
            anchor: None,
        }
    }

    /// Current position in seconds.
    pub fn position(&self) -> f64 {
        match self.anchor {
            Some(anchor) => self.base_seconds + anchor.elapsed().as_secs_f64(),
            None => self.base_seconds,
        }
    }

    /// True while the clock is advancing.
    pub fn is_running(&self) -> bool {
        self.anchor.is_some()
    }

    /// Starts advancing from the frozen position. No-op while running.
    pub fn resume(&mut self) {
        if self.anchor.is_none() {
            self.anchor = Some(Instant::now());
        }
    }

    /// Freezes the clock at its current position.
    pub fn pause(&mut self) {
        self.base_seconds = self.position();
        self.anchor = None;
    }

    /// Jumps to `position`, keeping the running state.
    pub fn seek(&mut self, position: f64) {
        self.base_seconds = position.max(0.0);
        if self.anchor.is_some() {
            self.anchor = Some(Instant::now());
        }
    }
}

/// Commands selected by one tick, as (track index, command index) pairs.
#[derive(Debug, Default, PartialEq)]
pub struct DueCommands {
    pub ready: Vec<(usize, usize)>,
    /// Commands passed over because the clock was already too far beyond
    /// their dispatch time.
    pub stale: usize,
}

/// Next undispatched command per track. Cursors only move forward except
/// on an explicit backward seek.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackCursors {
    positions: Vec<usize>,
}

impl TrackCursors {
    /// Cursors at the first command at or after `position` on every track.
    pub fn new(timeline: &Timeline, position: f64) -> Self {
        Self {
            positions: timeline
                .tracks
                .iter()
                .map(|track| track.first_at_or_after(position))
                .collect(),
        }
    }

    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// Advances every cursor past commands whose dispatch time is at or
    /// before `now + lookahead`.
    pub fn collect_due(&mut self, timeline: &Timeline, now: f64, lookahead: f64, stale_tolerance: f64) -> DueCommands {
        let mut due = DueCommands::default();
        let horizon = now + lookahead;

        for (track_index, (track, cursor)) in timeline.tracks.iter().zip(&mut self.positions).enumerate() {
            while let Some(command) = track.commands.get(*cursor) {
                let dispatch_at = track.dispatch_time(command);
                if dispatch_at > horizon {
                    break;
                }
                if dispatch_at < now - stale_tolerance {
                    due.stale += 1;
                } else {
                    due.ready.push((track_index, *cursor));
                }
                *cursor += 1;
            }
        }
        due
    }

    /// Moves every cursor to the first command at or after `position`.
    /// Returns how many commands a forward move skipped.
    pub fn seek(&mut self, timeline: &Timeline, position: f64) -> usize {
        let mut skipped = 0;
        for (track, cursor) in timeline.tracks.iter().zip(&mut self.positions) {
            let target = track.first_at_or_after(position);
            skipped += target.saturating_sub(*cursor);
            *cursor = target;
        }
        skipped
    }

    pub fn is_exhausted(&self, timeline: &Timeline) -> bool {
        timeline
            .tracks
            .iter()
            .zip(&self.positions)
            .all(|(track, cursor)| *cursor >= track.commands.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    Idle,
    Playing,
    Paused,
    Stopped,
}

impl std::fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PlaybackStatus::Idle => "idle",
            PlaybackStatus::Playing => "playing",
            PlaybackStatus::Paused => "paused",
            PlaybackStatus::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub dispatched: u64,
    /// Rejected because the device queue was full.
    pub dropped: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub stale: u64,
    /// Passed over by a forward seek or discarded from an older seek.
    pub skipped: u64,
    pub unsupported: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    dispatched: AtomicU64,
    dropped: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
    stale: AtomicU64,
    skipped: AtomicU64,
    unsupported: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            unsupported: self.unsupported.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of a running playback.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackSession {
    pub session_id: String,
    pub timeline_id: String,
    pub position: f64,
    pub status: PlaybackStatus,
    pub started_at: DateTime<Utc>,
}

struct State {
    status: PlaybackStatus,
    clock: PlaybackClock,
    timeline: Option<Arc<Timeline>>,
    cursors: TrackCursors,
    lanes: Vec<mpsc::Sender<Queued>>,
    session_id: String,
    started_at: Option<DateTime<Utc>>,
}

struct Shared {
    state: Mutex<State>,
    stats: StatsCounters,
    generation: AtomicU64,
    permits: Semaphore,
    token: CancellationToken,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| LightSyncError::msg("playback state has been poisoned"))
    }
}

/// Plays one timeline. State machine: idle, then playing and paused in
/// either order, then stopped for good.
pub struct PlaybackScheduler {
    hub: Arc<dyn HomeHub>,
    config: PlaybackConfig,
    capabilities: HashMap<String, CapabilitySet>,
    shared: Arc<Shared>,
}

impl PlaybackScheduler {
    /// An idle scheduler. Nothing runs until [`PlaybackScheduler::play`].
    pub fn new(hub: Arc<dyn HomeHub>, config: PlaybackConfig) -> Self {
        let shared = Shared {
            state: Mutex::new(State {
                status: PlaybackStatus::Idle,
                clock: PlaybackClock::new(0.0),
                timeline: None,
                cursors: TrackCursors {
                    positions: Vec::new(),
                },
                lanes: Vec::new(),
                session_id: uuid::Uuid::new_v4().to_string(),
                started_at: None,
            }),
            stats: StatsCounters::default(),
            generation: AtomicU64::new(0),
            permits: Semaphore::new(config.max_concurrent_dispatches.max(1)),
            token: CancellationToken::new(),
        };
        Self {
            hub,
            config,
            capabilities: HashMap::new(),
            shared: Arc::new(shared),
        }
    }

    /// Known device capabilities. Commands a listed device cannot honour
    /// are dropped instead of sent.
    pub fn with_capabilities(mut self, capabilities: HashMap<String, CapabilitySet>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Starts playback at `start_position` seconds. Must be called from
    /// within a tokio runtime.
    pub fn play(&self, timeline: Arc<Timeline>, start_position: f64) -> Result<()> {
        if !start_position.is_finite() || start_position < 0.0 {
            return Err(LightSyncError::input(format!(
                "invalid start position {start_position}"
            )));
        }

        let mut state = self.shared.lock()?;
        if state.status != PlaybackStatus::Idle {
            return Err(LightSyncError::input(format!(
                "cannot play: playback is {}",
                state.status
            )));
        }

        // A lane holds one received command while it waits to send, so the
        // channel takes the rest of the depth.
        let depth = self.config.max_queue_depth.saturating_sub(1).max(1);
        let mut lanes = Vec::with_capacity(timeline.tracks.len());
        for track in &timeline.tracks {
            let (tx, rx) = mpsc::channel(depth);
            let lane = Lane {
                entity_id: track.entity_id.clone(),
                hub: self.hub.clone(),
                shared: self.shared.clone(),
                capabilities: self.capabilities.get(&track.entity_id).cloned(),
                min_interval: self.config.min_command_interval(),
                dispatch_timeout: self.config.dispatch_timeout(),
            };
            tokio::spawn(lane.run(rx));
            lanes.push(tx);
        }

        state.cursors = TrackCursors::new(&timeline, start_position);
        state.clock = PlaybackClock::new(start_position);
        state.clock.resume();
        state.lanes = lanes;
        state.started_at = Some(Utc::now());
        state.status = PlaybackStatus::Playing;
        tracing::info!(
            session_id = %state.session_id,
            timeline_id = %timeline.id,
            tracks = timeline.tracks.len(),
            start_position,
            "playback started"
        );
        state.timeline = Some(timeline);
        drop(state);

        let ticker = PeriodicTicker::with_token(self.config.tick_interval(), self.shared.token.clone());
        let shared = self.shared.clone();
        let lookahead = self.config.lookahead_seconds();
        let stale_tolerance = self.config.stale_tolerance_seconds();
        ticker.spawn(move |_| std::future::ready(tick(&shared, lookahead, stale_tolerance)));
        Ok(())
    }

    /// Freezes the clock. Commands already queued still drain.
    pub fn pause(&self) -> Result<()> {
        let mut state = self.shared.lock()?;
        match state.status {
            PlaybackStatus::Playing => {
                state.clock.pause();
                state.status = PlaybackStatus::Paused;
                tracing::info!(position = state.clock.position(), "playback paused");
                Ok(())
            }
            PlaybackStatus::Paused => Ok(()),
            other => Err(LightSyncError::input(format!("cannot pause: playback is {other}"))),
        }
    }

    /// Restarts the clock from where it was paused.
    pub fn resume(&self) -> Result<()> {
        let mut state = self.shared.lock()?;
        match state.status {
            PlaybackStatus::Paused => {
                state.clock.resume();
                state.status = PlaybackStatus::Playing;
                tracing::info!(position = state.clock.position(), "playback resumed");
                Ok(())
            }
            PlaybackStatus::Playing => Ok(()),
            other => Err(LightSyncError::input(format!("cannot resume: playback is {other}"))),
        }
    }

    /// Re-anchors playback at `position` without changing status. Queued
    /// commands are discarded; a backward seek makes earlier commands
    /// eligible again.
    pub fn seek(&self, position: f64) -> Result<()> {
        if !position.is_finite() || position < 0.0 {
            return Err(LightSyncError::input(format!("invalid seek position {position}")));
        }
        let mut state = self.shared.lock()?;
        if !matches!(state.status, PlaybackStatus::Playing | PlaybackStatus::Paused) {
            return Err(LightSyncError::input(format!(
                "cannot seek: playback is {}",
                state.status
            )));
        }
        let Some(timeline) = state.timeline.clone() else {
            return Err(LightSyncError::msg("playing without a timeline"));
        };

        let position = position.min(timeline.duration);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let skipped = state.cursors.seek(&timeline, position);
        state.clock.seek(position);
        self.shared
            .stats
            .skipped
            .fetch_add(skipped as u64, Ordering::Relaxed);
        tracing::info!(position, skipped, "playback seeked");
        Ok(())
    }

    /// Ends playback. No tick after this dispatches anything; calls already
    /// on the wire finish but their results are ignored.
    pub fn stop(&self) -> Result<()> {
        self.shared.token.cancel();
        let mut state = self.shared.lock()?;
        if state.status != PlaybackStatus::Stopped {
            state.clock.pause();
            state.status = PlaybackStatus::Stopped;
            state.lanes.clear();
            tracing::info!(
                session_id = %state.session_id,
                stats = ?self.shared.stats.snapshot(),
                "playback stopped"
            );
        }
        Ok(())
    }

    pub fn status(&self) -> PlaybackStatus {
        self.shared
            .lock()
            .map(|state| state.status)
            .unwrap_or(PlaybackStatus::Stopped)
    }

    pub fn position(&self) -> f64 {
        self.shared
            .lock()
            .map(|state| state.clock.position())
            .unwrap_or(0.0)
    }

    /// Counters accumulated since play.
    pub fn stats(&self) -> DispatchStats {
        self.shared.stats.snapshot()
    }

    /// True once the clock is past the end and every command was handed
    /// off.
    pub fn is_finished(&self) -> bool {
        self.shared
            .lock()
            .map(|state| match &state.timeline {
                Some(timeline) => {
                    state.clock.position() >= timeline.duration && state.cursors.is_exhausted(timeline)
                }
                None => false,
            })
            .unwrap_or(true)
    }

    /// Entities driven by the loaded timeline.
    pub fn entity_ids(&self) -> Vec<String> {
        self.shared
            .lock()
            .ok()
            .and_then(|state| {
                state
                    .timeline
                    .as_ref()
                    .map(|t| t.entity_ids().into_iter().map(str::to_string).collect())
            })
            .unwrap_or_default()
    }

    pub fn session(&self) -> Option<PlaybackSession> {
        let state = self.shared.lock().ok()?;
        let timeline = state.timeline.as_ref()?;
        Some(PlaybackSession {
            session_id: state.session_id.clone(),
            timeline_id: timeline.id.clone(),
            position: state.clock.position(),
            status: state.status,
            started_at: state.started_at?,
        })
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

/// One scheduling step: select due commands and hand them to their lanes
/// without waiting on any device.
fn tick(shared: &Shared, lookahead: f64, stale_tolerance: f64) -> ControlFlow<()> {
    let Ok(mut state) = shared.lock() else {
        return ControlFlow::Break(());
    };
    match state.status {
        PlaybackStatus::Playing => {}
        PlaybackStatus::Idle | PlaybackStatus::Paused => return ControlFlow::Continue(()),
        PlaybackStatus::Stopped => return ControlFlow::Break(()),
    }
    let Some(timeline) = state.timeline.clone() else {
        return ControlFlow::Continue(());
    };

    let now = state.clock.position();
    let due = state
        .cursors
        .collect_due(&timeline, now, lookahead, stale_tolerance);
    if due.stale > 0 {
        tracing::debug!(stale = due.stale, position = now, "skipped stale commands");
        shared.stats.stale.fetch_add(due.stale as u64, Ordering::Relaxed);
    }

    let generation = shared.generation.load(Ordering::SeqCst);
    for (track_index, command_index) in due.ready {
        let track = &timeline.tracks[track_index];
        let Some(lane) = state.lanes.get(track_index) else {
            continue;
        };
        let queued = Queued {
            generation,
            command: track.commands[command_index].clone(),
        };
        if let Err(err) = lane.try_send(queued) {
            shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "lane closed",
            };
            tracing::warn!(entity_id = %track.entity_id, reason, "dropping command");
        }
    }
    ControlFlow::Continue(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        hub::{SimulatedHub, SimulatedLight},
        timeline::{
            tests::{command, timeline},
            CommandPayload, CommandType, Track,
        },
    };

    fn config() -> PlaybackConfig {
        PlaybackConfig {
            tick_interval_ms: 20,
            lookahead_ms: 100,
            max_queue_depth: 8,
            min_command_interval_ms: 0,
            dispatch_timeout_ms: 1_000,
            max_concurrent_dispatches: 4,
            stale_tolerance_ms: 500,
        }
    }

    /// One command per `step` seconds, brightness set to the command index.
    fn track(entity_id: &str, count: usize, step: f64) -> Track {
        Track {
            entity_id: entity_id.to_string(),
            latency_ms: 0.0,
            commands: (0..count).map(|i| command(i as f64 * step, i as u8)).collect(),
        }
    }

    fn hub() -> Arc<SimulatedHub> {
        Arc::new(SimulatedHub::new(vec![
            SimulatedLight::new("light.a", "A"),
            SimulatedLight::new("light.b", "B"),
        ]))
    }

    fn sent_levels(hub: &SimulatedHub, entity_id: &str) -> Vec<u64> {
        hub.invocations_for(entity_id)
            .iter()
            .filter_map(|call| call.payload.get("brightness").and_then(|b| b.as_u64()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn clock_pauses_resumes_and_seeks() {
        let mut clock = PlaybackClock::new(2.0);
        assert_eq!(clock.position(), 2.0);
        clock.resume();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!((clock.position() - 2.5).abs() < 1e-9);

        clock.pause();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!((clock.position() - 2.5).abs() < 1e-9);

        clock.resume();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!((clock.position() - 2.75).abs() < 1e-9);

        clock.seek(1.0);
        assert!((clock.position() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cursors_collect_window_and_skip_stale() {
        let tl = timeline(vec![Track {
            entity_id: "light.a".to_string(),
            latency_ms: 0.0,
            commands: vec![command(0.2, 0), command(0.6, 1), command(1.05, 2), command(1.5, 3)],
        }]);
        let mut cursors = TrackCursors::new(&tl, 0.0);

        let due = cursors.collect_due(&tl, 1.0, 0.1, 0.5);
        assert_eq!(due.ready, vec![(0, 1), (0, 2)]);
        assert_eq!(due.stale, 1);
        assert_eq!(cursors.positions(), &[3]);

        assert_eq!(cursors.collect_due(&tl, 1.0, 0.1, 0.5), DueCommands::default());
        assert_eq!(cursors.seek(&tl, 0.0), 0);
        assert_eq!(cursors.positions(), &[0]);
        assert_eq!(cursors.seek(&tl, 1.2), 3);
        assert!(!cursors.is_exhausted(&tl));
    }

    #[test]
    fn cursors_use_latency_compensated_times() {
        let tl = timeline(vec![Track {
            entity_id: "light.a".to_string(),
            latency_ms: 300.0,
            commands: vec![command(0.1, 0), command(0.5, 1), command(0.9, 2)],
        }]);
        let mut cursors = TrackCursors::new(&tl, 0.0);

        // Dispatch times are 0.0 (clamped), 0.2 and 0.6.
        let due = cursors.collect_due(&tl, 0.1, 0.15, 0.5);
        assert_eq!(due.ready, vec![(0, 0), (0, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_each_command_once_across_pause_and_resume() {
        let hub = hub();
        let tl = Arc::new(timeline(vec![track("light.a", 10, 0.1), track("light.b", 5, 0.2)]));
        let scheduler = PlaybackScheduler::new(hub.clone(), config());

        scheduler.play(tl, 0.0).unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        scheduler.pause().unwrap();
        assert_eq!(scheduler.status(), PlaybackStatus::Paused);
        let paused_at = scheduler.position();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(scheduler.position(), paused_at);
        let sent_while_paused = hub.invocations().len();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hub.invocations().len(), sent_while_paused);

        scheduler.resume().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(sent_levels(&hub, "light.a"), (0..10).collect::<Vec<_>>());
        assert_eq!(sent_levels(&hub, "light.b"), (0..5).collect::<Vec<_>>());
        assert_eq!(scheduler.stats().dispatched, 15);
        assert!(!scheduler.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_instead_of_growing() {
        let hub = Arc::new(
            SimulatedHub::new(vec![SimulatedLight::new("light.a", "A")])
                .with_invoke_latency(Duration::from_millis(500)),
        );
        let burst = Track {
            entity_id: "light.a".to_string(),
            latency_ms: 0.0,
            commands: (0..10).map(|i| command(0.0, i)).collect(),
        };
        let scheduler = PlaybackScheduler::new(
            hub.clone(),
            PlaybackConfig {
                max_queue_depth: 3,
                dispatch_timeout_ms: 5_000,
                ..config()
            },
        );

        scheduler.play(Arc::new(timeline(vec![burst])), 0.0).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let stats = scheduler.stats();
        assert_eq!(stats.dropped, 8);
        assert_eq!(stats.dispatched, 2);
        assert_eq!(hub.invocations().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn command_waiting_in_lane_counts_toward_queue_depth() {
        let hub = hub();
        let mut commands = vec![command(0.0, 0), command(0.2, 1)];
        commands.extend((2..7).map(|i| command(0.5, i)));
        let paced = Track {
            entity_id: "light.a".to_string(),
            latency_ms: 0.0,
            commands,
        };
        let scheduler = PlaybackScheduler::new(
            hub.clone(),
            PlaybackConfig {
                lookahead_ms: 0,
                max_queue_depth: 2,
                min_command_interval_ms: 1_000,
                ..config()
            },
        );

        scheduler.play(Arc::new(timeline(vec![paced])), 0.0).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        // Level 1 waits out the spacing in the lane, so only one of the
        // burst at 0.5 s fits.
        let stats = scheduler.stats();
        assert_eq!(stats.dropped, 4);
        assert_eq!(stats.dispatched, 3);
        assert_eq!(sent_levels(&hub, "light.a"), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn seeking_skips_forward_and_replays_backward() {
        let hub = hub();
        let tl = Arc::new(timeline(vec![track("light.a", 20, 0.1)]));
        let scheduler = PlaybackScheduler::new(hub.clone(), config());

        scheduler.play(tl, 0.0).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        scheduler.seek(1.45).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let sent = sent_levels(&hub, "light.a");
        assert!(sent.starts_with(&[0, 1, 2]));
        assert!(sent.iter().all(|level| !(4..15).contains(level)));
        assert!(sent.ends_with(&[15, 16, 17, 18, 19]));
        assert!(scheduler.stats().skipped > 0);

        scheduler.seek(0.0).unwrap();
        assert_eq!(scheduler.status(), PlaybackStatus::Playing);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let replays = sent_levels(&hub, "light.a")
            .iter()
            .filter(|level| **level == 0)
            .count();
        assert_eq!(replays, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_dispatch() {
        let hub = hub();
        let tl = Arc::new(timeline(vec![track("light.a", 50, 0.1)]));
        let scheduler = PlaybackScheduler::new(hub.clone(), config());

        scheduler.play(tl, 0.0).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.stop().unwrap();
        let sent = hub.invocations().len();
        assert!(sent > 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(hub.invocations().len(), sent);
        assert_eq!(scheduler.status(), PlaybackStatus::Stopped);
        assert!(scheduler.pause().is_err());
        assert!(scheduler.seek(1.0).is_err());
        assert!(scheduler.play(Arc::new(timeline(vec![])), 0.0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_devices_time_out_without_blocking_others() {
        let hub = Arc::new(SimulatedHub::new(vec![
            SimulatedLight::new("light.a", "A"),
            SimulatedLight::new("light.b", "B").offline(),
        ]));
        let tl = Arc::new(timeline(vec![track("light.a", 5, 0.1), track("light.b", 5, 0.1)]));
        let scheduler = PlaybackScheduler::new(hub.clone(), config());

        scheduler.play(tl, 0.0).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let stats = scheduler.stats();
        assert_eq!(stats.dispatched, 5);
        assert_eq!(stats.failed, 5);

        let slow = Arc::new(
            SimulatedHub::new(vec![SimulatedLight::new("light.a", "A")])
                .with_invoke_latency(Duration::from_secs(3)),
        );
        let scheduler = PlaybackScheduler::new(slow, config());
        scheduler
            .play(Arc::new(timeline(vec![track("light.a", 2, 0.1)])), 0.0)
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(scheduler.stats().timed_out, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_commands_are_dropped() {
        let hub = hub();
        let color = Track {
            entity_id: "light.a".to_string(),
            latency_ms: 0.0,
            commands: vec![crate::timeline::Command {
                timestamp_seconds: 0.0,
                command_type: CommandType::SetColor,
                payload: CommandPayload {
                    rgb_color: Some([255, 0, 0]),
                    ..Default::default()
                },
                transition_ms: 0,
            }],
        };
        let capabilities = HashMap::from([(
            "light.a".to_string(),
            CapabilitySet {
                supports_brightness: true,
                ..Default::default()
            },
        )]);
        let scheduler = PlaybackScheduler::new(hub.clone(), config()).with_capabilities(capabilities);

        scheduler.play(Arc::new(timeline(vec![color])), 0.0).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(hub.invocations().is_empty());
        assert_eq!(scheduler.stats().unsupported, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lanes_space_commands_by_min_interval() {
        let hub = hub();
        let tl = Arc::new(timeline(vec![Track {
            entity_id: "light.a".to_string(),
            latency_ms: 0.0,
            commands: (0..3).map(|i| command(0.0, i)).collect(),
        }]));
        let scheduler = PlaybackScheduler::new(
            hub.clone(),
            PlaybackConfig {
                min_command_interval_ms: 50,
                ..config()
            },
        );

        scheduler.play(tl, 0.0).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let calls = hub.invocations_for("light.a");
        assert_eq!(calls.len(), 3);
        for pair in calls.windows(2) {
            assert!(pair[1].at - pair[0].at >= Duration::from_millis(50));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_session_snapshot() {
        let scheduler = PlaybackScheduler::new(hub(), config());
        assert!(scheduler.session().is_none());
        assert_eq!(scheduler.status(), PlaybackStatus::Idle);

        scheduler
            .play(Arc::new(timeline(vec![track("light.a", 3, 0.5)])), 1.0)
            .unwrap();
        let session = scheduler.session().unwrap();
        assert_eq!(session.timeline_id, "tl-1");
        assert_eq!(session.status, PlaybackStatus::Playing);
        assert!(session.position >= 1.0);
        assert_eq!(scheduler.entity_ids(), vec!["light.a".to_string()]);
    }
}
