//! Control surface over running light shows: timeline playbacks and simple
//! looping animations. The store is owned by the entry point and is the only
//! place that knows which session drives which device.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    ops::ControlFlow,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    config::PlaybackConfig,
    hub::HomeHub,
    mapping::{color, Rgb},
    scanner::{CapabilitySet, LightDevice},
    scheduler::{DispatchStats, PlaybackScheduler, PlaybackStatus},
    ticker::PeriodicTicker,
    timeline::TimelineStore,
    LightSyncError, Result,
};

/// Uniform `{success, message}` envelope returned by every control
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            session_id: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            session_id: None,
        }
    }

    fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

impl From<Result<String>> for ControlResponse {
    fn from(result: Result<String>) -> Self {
        match result {
            Ok(message) => ControlResponse::ok(message),
            Err(err) => ControlResponse::fail(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimationKind {
    /// Hard alternation between bright and dim.
    Pulse,
    /// Smooth sinusoidal brightness swell.
    Breathe,
    /// Walks the hue wheel once per period.
    ColorCycle,
}

impl fmt::Display for AnimationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AnimationKind::Pulse => "pulse",
            AnimationKind::Breathe => "breathe",
            AnimationKind::ColorCycle => "color_cycle",
        })
    }
}

impl FromStr for AnimationKind {
    type Err = LightSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pulse" => Ok(AnimationKind::Pulse),
            "breathe" => Ok(AnimationKind::Breathe),
            "color_cycle" => Ok(AnimationKind::ColorCycle),
            other => Err(LightSyncError::input(format!("unknown animation `{other}`"))),
        }
    }
}

/// A looping, timeline-free animation over a set of lights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimationSpec {
    pub kind: AnimationKind,
    pub entity_ids: Vec<String>,
    pub period_ms: u64,
    pub step_ms: u64,
    /// Colour for pulse and breathe on colour lights.
    #[serde(default)]
    pub color: Option<Rgb>,
    pub low_brightness: u8,
    pub high_brightness: u8,
}

impl AnimationSpec {
    pub fn new(kind: AnimationKind, entity_ids: Vec<String>) -> Self {
        Self {
            kind,
            entity_ids,
            period_ms: 2_000,
            step_ms: 250,
            color: None,
            low_brightness: 40,
            high_brightness: 255,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.entity_ids.is_empty() {
            return Err(LightSyncError::input("animation needs at least one light"));
        }
        if self.period_ms == 0 || self.step_ms == 0 {
            return Err(LightSyncError::input("animation period and step must be > 0"));
        }
        Ok(())
    }

    /// Service payload for one light at `phase` in [0, 1).
    fn payload_at(&self, entity_id: &str, phase: f32) -> serde_json::Value {
        let low = self.low_brightness as f32;
        let high = self.high_brightness as f32;
        let transition = self.step_ms as f64 / 1000.0;

        let mut payload = json!({ "entity_id": entity_id, "transition": transition });
        match self.kind {
            AnimationKind::Pulse => {
                let level = if phase < 0.5 { high } else { low };
                payload["brightness"] = json!(level.round() as u8);
                payload["transition"] = json!(0);
            }
            AnimationKind::Breathe => {
                let swell = 0.5 - 0.5 * (phase * std::f32::consts::TAU).cos();
                payload["brightness"] = json!((low + (high - low) * swell).round() as u8);
            }
            AnimationKind::ColorCycle => {
                payload["rgb_color"] = json!(color::hsv_to_rgb(phase * 360.0, 1.0, 1.0));
                payload["brightness"] = json!(self.high_brightness);
            }
        }
        if let (Some(rgb), AnimationKind::Pulse | AnimationKind::Breathe) = (self.color, self.kind) {
            payload["rgb_color"] = json!(rgb);
        }
        payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Paused,
    Stopped,
}

impl SessionStatus {
    fn is_active(self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Paused)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionKind {
    Timeline { timeline_id: String, start_position: f64 },
    Animation { animation: AnimationKind },
}

/// Listing entry for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub kind: SessionKind,
    pub entity_ids: Vec<String>,
    pub status: SessionStatus,
    /// Playback position for timeline sessions.
    pub position: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<DispatchStats>,
    pub created_at: DateTime<Utc>,
}

struct AnimationRunner {
    spec: AnimationSpec,
    ticker: Option<PeriodicTicker>,
    paused: Arc<AtomicBool>,
}

impl AnimationRunner {
    fn start(&mut self, hub: Arc<dyn HomeHub>, call_timeout: Duration) {
        let ticker = PeriodicTicker::new(Duration::from_millis(self.spec.step_ms));
        let spec = Arc::new(self.spec.clone());
        let paused = self.paused.clone();

        ticker.spawn(move |tick| {
            let hub = hub.clone();
            let spec = spec.clone();
            let paused = paused.load(Ordering::SeqCst);
            async move {
                if paused {
                    return ControlFlow::Continue(());
                }
                let elapsed = tick * spec.step_ms;
                let phase = (elapsed % spec.period_ms) as f32 / spec.period_ms as f32;
                let calls = spec.entity_ids.iter().map(|entity_id| {
                    let hub = hub.clone();
                    let payload = spec.payload_at(entity_id, phase);
                    async move {
                        let call = hub.invoke_service("light", "turn_on", payload);
                        match tokio::time::timeout(call_timeout, call).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => tracing::warn!(entity_id, %err, "animation step failed"),
                            Err(_) => tracing::warn!(entity_id, "animation step timed out"),
                        }
                    }
                });
                futures::future::join_all(calls).await;
                ControlFlow::Continue(())
            }
        });
        self.ticker = Some(ticker);
    }

    fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop();
        }
    }
}

enum Runner {
    Timeline {
        scheduler: PlaybackScheduler,
        timeline_id: String,
        start_position: f64,
    },
    Animation(AnimationRunner),
}

struct Session {
    entity_ids: Vec<String>,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    runner: Runner,
}

impl Session {
    fn kind(&self) -> SessionKind {
        match &self.runner {
            Runner::Timeline {
                timeline_id,
                start_position,
                ..
            } => SessionKind::Timeline {
                timeline_id: timeline_id.clone(),
                start_position: *start_position,
            },
            Runner::Animation(runner) => SessionKind::Animation {
                animation: runner.spec.kind,
            },
        }
    }

    fn halt(&mut self) {
        match &mut self.runner {
            Runner::Timeline { scheduler, .. } => {
                if let Err(err) = scheduler.stop() {
                    tracing::warn!(%err, "stopping playback failed");
                }
            }
            Runner::Animation(runner) => runner.stop(),
        }
        self.status = SessionStatus::Stopped;
    }
}

/// Registry of sessions plus the timelines they can play.
pub struct SessionStore {
    hub: Arc<dyn HomeHub>,
    playback: PlaybackConfig,
    timelines: TimelineStore,
    capabilities: HashMap<String, CapabilitySet>,
    sessions: BTreeMap<String, Session>,
}

impl SessionStore {
    pub fn new(hub: Arc<dyn HomeHub>, playback: PlaybackConfig, timelines: TimelineStore) -> Self {
        Self {
            hub,
            playback,
            timelines,
            capabilities: HashMap::new(),
            sessions: BTreeMap::new(),
        }
    }

    /// Scanned lights. Timeline sessions drop commands a listed light
    /// cannot honour instead of sending them.
    pub fn with_devices(mut self, devices: &[LightDevice]) -> Self {
        self.capabilities = devices
            .iter()
            .map(|d| (d.entity_id.clone(), d.capabilities.clone()))
            .collect();
        self
    }

    pub fn timelines(&self) -> &TimelineStore {
        &self.timelines
    }

    pub fn timelines_mut(&mut self) -> &mut TimelineStore {
        &mut self.timelines
    }

    /// Registers a playback session for a stored timeline. Nothing is sent
    /// until [`SessionStore::start`].
    pub fn create_timeline_session(&mut self, timeline_id: &str, start_position: f64) -> ControlResponse {
        let Some(timeline) = self.timelines.get(timeline_id) else {
            return ControlResponse::fail(format!("timeline `{timeline_id}` not found"));
        };
        if !start_position.is_finite() || start_position < 0.0 || start_position > timeline.duration {
            return ControlResponse::fail(format!(
                "start position {start_position} is outside the timeline (0..{})",
                timeline.duration
            ));
        }

        let entity_ids: Vec<String> = timeline.entity_ids().into_iter().map(str::to_string).collect();
        let capabilities = entity_ids
            .iter()
            .filter_map(|id| self.capabilities.get(id).map(|c| (id.clone(), c.clone())))
            .collect();
        let scheduler = PlaybackScheduler::new(self.hub.clone(), self.playback.clone())
            .with_capabilities(capabilities);
        self.insert(
            entity_ids,
            Runner::Timeline {
                scheduler,
                timeline_id: timeline_id.to_string(),
                start_position,
            },
        )
    }

    /// Registers a looping animation. Nothing is sent until started.
    pub fn create_animation_session(&mut self, spec: AnimationSpec) -> ControlResponse {
        if let Err(err) = spec.validate() {
            return ControlResponse::fail(err.to_string());
        }
        let entity_ids = spec.entity_ids.clone();
        self.insert(
            entity_ids,
            Runner::Animation(AnimationRunner {
                spec,
                ticker: None,
                paused: Arc::new(AtomicBool::new(false)),
            }),
        )
    }

    fn insert(&mut self, entity_ids: Vec<String>, runner: Runner) -> ControlResponse {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Session {
            entity_ids,
            status: SessionStatus::Created,
            created_at: Utc::now(),
            runner,
        };
        tracing::info!(session_id = %id, kind = ?session.kind(), "session created");
        self.sessions.insert(id.clone(), session);
        ControlResponse::ok(format!("session {id} created")).with_session(&id)
    }

    /// Starts a created session unless another active session already
    /// drives one of its lights.
    pub fn start(&mut self, session_id: &str) -> ControlResponse {
        self.respond(session_id, |store| store.try_start(session_id))
    }

    fn try_start(&mut self, session_id: &str) -> Result<String> {
        let session = self.session(session_id)?;
        if session.status != SessionStatus::Created {
            return Err(LightSyncError::input(format!(
                "session {session_id} cannot start from {:?}",
                session.status
            )));
        }

        if let Some((other, entity_id)) = self.conflict(session_id, &session.entity_ids) {
            return Err(LightSyncError::input(format!(
                "`{entity_id}` is already driven by session {other}"
            )));
        }

        let hub = self.hub.clone();
        let call_timeout = self.playback.dispatch_timeout();
        let timeline = match &self.session(session_id)?.runner {
            Runner::Timeline { timeline_id, .. } => Some(self.timelines.get(timeline_id).ok_or_else(|| {
                LightSyncError::input(format!("timeline `{timeline_id}` no longer exists"))
            })?),
            Runner::Animation(_) => None,
        };

        let session = self.session_mut(session_id)?;
        match (&mut session.runner, timeline) {
            (
                Runner::Timeline {
                    scheduler,
                    start_position,
                    ..
                },
                Some(timeline),
            ) => scheduler.play(timeline, *start_position)?,
            (Runner::Animation(runner), _) => runner.start(hub, call_timeout),
            (Runner::Timeline { .. }, None) => {
                return Err(LightSyncError::msg("timeline session without a timeline"))
            }
        }
        session.status = SessionStatus::Running;
        tracing::info!(session_id, "session started");
        Ok(format!("session {session_id} started"))
    }

    pub fn pause(&mut self, session_id: &str) -> ControlResponse {
        self.respond(session_id, |store| {
            let session = store.session_mut(session_id)?;
            if session.status != SessionStatus::Running {
                return Err(LightSyncError::input(format!("session {session_id} is not running")));
            }
            match &session.runner {
                Runner::Timeline { scheduler, .. } => scheduler.pause()?,
                Runner::Animation(runner) => runner.paused.store(true, Ordering::SeqCst),
            }
            session.status = SessionStatus::Paused;
            Ok(format!("session {session_id} paused"))
        })
    }

    pub fn resume(&mut self, session_id: &str) -> ControlResponse {
        self.respond(session_id, |store| {
            let session = store.session_mut(session_id)?;
            if session.status != SessionStatus::Paused {
                return Err(LightSyncError::input(format!("session {session_id} is not paused")));
            }
            match &session.runner {
                Runner::Timeline { scheduler, .. } => scheduler.resume()?,
                Runner::Animation(runner) => runner.paused.store(false, Ordering::SeqCst),
            }
            session.status = SessionStatus::Running;
            Ok(format!("session {session_id} resumed"))
        })
    }

    /// Seeks a timeline session.
    pub fn seek(&mut self, session_id: &str, position: f64) -> ControlResponse {
        self.respond(session_id, |store| match &store.session(session_id)?.runner {
            Runner::Timeline { scheduler, .. } => {
                scheduler.seek(position)?;
                Ok(format!("session {session_id} moved to {position:.2}s"))
            }
            Runner::Animation(_) => Err(LightSyncError::input("animations cannot seek")),
        })
    }

    /// Stops the session and forgets it.
    pub fn stop(&mut self, session_id: &str) -> ControlResponse {
        match self.sessions.remove(session_id) {
            Some(mut session) => {
                session.halt();
                tracing::info!(session_id, "session stopped");
                ControlResponse::ok(format!("session {session_id} stopped")).with_session(session_id)
            }
            None => ControlResponse::fail(format!("session {session_id} not found")),
        }
    }

    /// Stops and forgets every session.
    pub fn stop_all(&mut self) -> ControlResponse {
        let count = self.sessions.len();
        for (_, mut session) in std::mem::take(&mut self.sessions) {
            session.halt();
        }
        tracing::info!(count, "all sessions stopped");
        ControlResponse::ok(format!("stopped {count} session(s)"))
    }

    /// Snapshot of every session, ordered by id.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|(id, session)| {
                let (status, position, stats) = match &session.runner {
                    Runner::Timeline { scheduler, .. } => {
                        let status = match scheduler.status() {
                            PlaybackStatus::Idle => SessionStatus::Created,
                            PlaybackStatus::Playing => SessionStatus::Running,
                            PlaybackStatus::Paused => SessionStatus::Paused,
                            PlaybackStatus::Stopped => SessionStatus::Stopped,
                        };
                        (status, Some(scheduler.position()), Some(scheduler.stats()))
                    }
                    Runner::Animation(_) => (session.status, None, None),
                };
                SessionInfo {
                    id: id.clone(),
                    kind: session.kind(),
                    entity_ids: session.entity_ids.clone(),
                    status,
                    position,
                    stats,
                    created_at: session.created_at,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn conflict<'a>(&'a self, session_id: &str, entity_ids: &'a [String]) -> Option<(&'a str, &'a str)> {
        self.sessions
            .iter()
            .filter(|(id, other)| id.as_str() != session_id && other.status.is_active())
            .find_map(|(id, other)| {
                entity_ids
                    .iter()
                    .find(|entity_id| other.entity_ids.contains(entity_id))
                    .map(|entity_id| (id.as_str(), entity_id.as_str()))
            })
    }

    fn session(&self, session_id: &str) -> Result<&Session> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| LightSyncError::input(format!("session {session_id} not found")))
    }

    fn session_mut(&mut self, session_id: &str) -> Result<&mut Session> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| LightSyncError::input(format!("session {session_id} not found")))
    }

    fn respond<F>(&mut self, session_id: &str, op: F) -> ControlResponse
    where
        F: FnOnce(&mut Self) -> Result<String>,
    {
        let response = ControlResponse::from(op(self));
        if !response.success {
            tracing::debug!(session_id, message = %response.message, "control operation rejected");
        }
        response.with_session(session_id)
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        for session in self.sessions.values_mut() {
            session.halt();
        }
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.sessions.len())
            .field("timelines", &self.timelines.list().len())
            .finish()
    }
}
