//! The precomputed light show: one command track per device, exportable as a
//! JSON document.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    generator::GenerationSettings, mapping::Rgb, scanner::CapabilitySet, Capability,
    LightSyncError, Mood, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    SetBrightness,
    SetColor,
    SetColorTemp,
    SetEffect,
    TurnOn,
    TurnOff,
}

impl CommandType {
    /// Capability a device needs to honour this command.
    pub fn required_capability(self) -> Option<Capability> {
        match self {
            CommandType::SetBrightness => Some(Capability::Brightness),
            CommandType::SetColor => Some(Capability::Color),
            CommandType::SetColorTemp => Some(Capability::ColorTemp),
            CommandType::SetEffect => Some(Capability::Effects),
            CommandType::TurnOn | CommandType::TurnOff => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CommandType::SetBrightness => "set_brightness",
            CommandType::SetColor => "set_color",
            CommandType::SetColorTemp => "set_color_temp",
            CommandType::SetEffect => "set_effect",
            CommandType::TurnOn => "turn_on",
            CommandType::TurnOff => "turn_off",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rgb_color: Option<Rgb>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_temp_kelvin: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
}

/// One device instruction. `timestamp_seconds` is when the change should be
/// visible, relative to the start of the audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub timestamp_seconds: f64,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub payload: CommandPayload,
    pub transition_ms: u32,
}

impl Command {
    /// Checks the command against a device's capabilities.
    pub fn check_supported(&self, entity_id: &str, capabilities: &CapabilitySet) -> Result<()> {
        let supported = match self.command_type {
            CommandType::SetEffect => self
                .payload
                .effect
                .as_deref()
                .is_some_and(|effect| capabilities.supports_effect(effect)),
            other => other
                .required_capability()
                .map(|capability| capabilities.has(capability))
                .unwrap_or(true),
        };
        if supported {
            Ok(())
        } else {
            Err(LightSyncError::CapabilityMismatch {
                entity_id: entity_id.to_string(),
                command: self.command_type.label().to_string(),
            })
        }
    }

    /// Translates the command into a `light` domain service call.
    pub fn to_service_call(&self, entity_id: &str) -> (&'static str, Value) {
        let mut payload = json!({ "entity_id": entity_id });
        if self.command_type == CommandType::TurnOff {
            if self.transition_ms > 0 {
                payload["transition"] = json!(self.transition_ms as f64 / 1000.0);
            }
            return ("turn_off", payload);
        }

        if let Some(brightness) = self.payload.brightness {
            payload["brightness"] = json!(brightness);
        }
        if let Some(rgb) = self.payload.rgb_color {
            payload["rgb_color"] = json!(rgb);
        }
        if let Some(kelvin) = self.payload.color_temp_kelvin {
            payload["color_temp_kelvin"] = json!(kelvin);
        }
        if let Some(effect) = &self.payload.effect {
            payload["effect"] = json!(effect);
        }
        payload["transition"] = json!(self.transition_ms as f64 / 1000.0);
        ("turn_on", payload)
    }
}

/// Command sequence for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub entity_id: String,
    /// Measured response delay the track compensates for.
    #[serde(default)]
    pub latency_ms: f64,
    pub commands: Vec<Command>,
}

impl Track {
    /// When the scheduler should send `command` so that it becomes visible
    /// on time. Never negative.
    pub fn dispatch_time(&self, command: &Command) -> f64 {
        (command.timestamp_seconds - self.latency_ms / 1000.0).max(0.0)
    }

    /// Index of the first command whose dispatch time is at or after
    /// `position`.
    pub fn first_at_or_after(&self, position: f64) -> usize {
        self.commands
            .partition_point(|command| self.dispatch_time(command) < position)
    }

    fn validate(&self) -> Result<()> {
        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(LightSyncError::input(format!(
                "track `{}` has invalid latency {}",
                self.entity_id, self.latency_ms
            )));
        }
        let mut previous = f64::NEG_INFINITY;
        for (index, command) in self.commands.iter().enumerate() {
            let ts = command.timestamp_seconds;
            if !ts.is_finite() || ts < 0.0 {
                return Err(LightSyncError::input(format!(
                    "track `{}` command {index} has invalid timestamp {ts}",
                    self.entity_id
                )));
            }
            if ts < previous {
                return Err(LightSyncError::input(format!(
                    "track `{}` timestamps are not monotonic at command {index} ({ts} < {previous})",
                    self.entity_id
                )));
            }
            previous = ts;
        }
        Ok(())
    }
}

/// Audio summary embedded in the exported document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineAudio {
    pub bpm: Option<f32>,
    pub beats: Vec<f32>,
    pub mood: Mood,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineMetadata {
    pub command_count: usize,
    #[serde(default)]
    pub settings: GenerationSettings,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub id: String,
    pub name: String,
    pub duration: f64,
    #[serde(default)]
    pub audio_source: Option<String>,
    pub audio_features: TimelineAudio,
    pub tracks: Vec<Track>,
    pub metadata: TimelineMetadata,
}

impl Timeline {
    pub fn command_count(&self) -> usize {
        self.tracks.iter().map(|t| t.commands.len()).sum()
    }

    pub fn track(&self, entity_id: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.entity_id == entity_id)
    }

    pub fn entity_ids(&self) -> Vec<&str> {
        self.tracks.iter().map(|t| t.entity_id.as_str()).collect()
    }

    /// Checks the id, duration, per-track ordering and the declared command
    /// count.
    pub fn validate(&self) -> Result<()> {
        check_file_key("timeline id", &self.id)?;
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(LightSyncError::input("timeline duration must be non-negative"));
        }
        let mut seen = HashSet::new();
        for track in &self.tracks {
            if !seen.insert(track.entity_id.as_str()) {
                return Err(LightSyncError::input(format!(
                    "duplicate track for `{}`",
                    track.entity_id
                )));
            }
            track.validate()?;
        }
        if self.metadata.command_count != self.command_count() {
            return Err(LightSyncError::input(format!(
                "metadata.commandCount is {} but tracks hold {} commands",
                self.metadata.command_count,
                self.command_count()
            )));
        }
        Ok(())
    }

    /// Pretty JSON in the exchange format.
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses and validates an exported document.
    pub fn import_json(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| LightSyncError::input(format!("timeline is not valid JSON: {e}")))?;
        if !value.get("tracks").is_some_and(Value::is_array) {
            return Err(LightSyncError::input("timeline document has no `tracks` array"));
        }
        let timeline: Timeline = serde_json::from_value(value)
            .map_err(|e| LightSyncError::input(format!("malformed timeline document: {e}")))?;
        timeline.validate()?;
        Ok(timeline)
    }
}

/// Short listing entry for stored timelines.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineSummary {
    pub id: String,
    pub name: String,
    pub duration: f64,
    pub tracks: usize,
    pub command_count: usize,
}

/// Keeps generated timelines, optionally mirrored to `<dir>/<id>.json`.
/// Timelines only leave the store through [`TimelineStore::delete`].
#[derive(Debug, Default)]
pub struct TimelineStore {
    timelines: BTreeMap<String, Arc<Timeline>>,
    dir: Option<PathBuf>,
}

impl TimelineStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a directory-backed store, loading every valid document in it.
    /// Invalid files are skipped with a warning.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut timelines = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(LightSyncError::from)
                .and_then(|raw| Timeline::import_json(&raw))
            {
                Ok(timeline) => {
                    timelines.insert(timeline.id.clone(), Arc::new(timeline));
                }
                Err(err) => tracing::warn!(?path, %err, "skipping unreadable timeline"),
            }
        }

        tracing::debug!(?dir, count = timelines.len(), "opened timeline store");
        Ok(Self {
            timelines,
            dir: Some(dir),
        })
    }

    /// Validates and stores `timeline`, writing it to disk for directory stores.
    pub fn insert(&mut self, timeline: Timeline) -> Result<Arc<Timeline>> {
        timeline.validate()?;
        if let Some(dir) = &self.dir {
            std::fs::write(Self::path_for(dir, &timeline.id), timeline.export_json()?)?;
        }
        let timeline = Arc::new(timeline);
        self.timelines
            .insert(timeline.id.clone(), timeline.clone());
        Ok(timeline)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Timeline>> {
        self.timelines.get(id).cloned()
    }

    /// Summaries of stored timelines.
    pub fn list(&self) -> Vec<TimelineSummary> {
        self.timelines
            .values()
            .map(|t| TimelineSummary {
                id: t.id.clone(),
                name: t.name.clone(),
                duration: t.duration,
                tracks: t.tracks.len(),
                command_count: t.metadata.command_count,
            })
            .collect()
    }

    /// Removes a timeline. Returns false when the id is unknown.
    pub fn delete(&mut self, id: &str) -> Result<bool> {
        if self.timelines.remove(id).is_none() {
            return Ok(false);
        }
        if let Some(dir) = &self.dir {
            let path = Self::path_for(dir, id);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(true)
    }

    fn path_for(dir: &Path, id: &str) -> PathBuf {
        dir.join(format!("{id}.json"))
    }
}

/// Ids double as file names in the stores, so they must stay a single
/// path component.
pub(crate) fn check_file_key(what: &str, key: &str) -> Result<()> {
    let plain = !key.is_empty()
        && !key.starts_with('.')
        && !key.contains("..")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if plain {
        Ok(())
    } else {
        Err(LightSyncError::input(format!("{what} `{key}` is not a plain name")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn command(ts: f64, brightness: u8) -> Command {
        Command {
            timestamp_seconds: ts,
            command_type: CommandType::SetBrightness,
            payload: CommandPayload {
                brightness: Some(brightness),
                ..Default::default()
            },
            transition_ms: 0,
        }
    }

    pub(crate) fn timeline(tracks: Vec<Track>) -> Timeline {
        let command_count = tracks.iter().map(|t| t.commands.len()).sum();
        Timeline {
            id: "tl-1".to_string(),
            name: "Test".to_string(),
            duration: 10.0,
            audio_source: Some("song.wav".to_string()),
            audio_features: TimelineAudio {
                bpm: Some(120.0),
                beats: vec![0.5, 1.0],
                mood: Mood::Happy,
            },
            tracks,
            metadata: TimelineMetadata {
                command_count,
                settings: GenerationSettings::default(),
                created_at: None,
            },
        }
    }

    fn sample() -> Timeline {
        timeline(vec![
            Track {
                entity_id: "light.a".to_string(),
                latency_ms: 120.0,
                commands: vec![command(0.05, 10), command(0.5, 200), command(1.25, 90)],
            },
            Track {
                entity_id: "light.b".to_string(),
                latency_ms: 0.0,
                commands: vec![Command {
                    timestamp_seconds: 0.333,
                    command_type: CommandType::SetColor,
                    payload: CommandPayload {
                        brightness: Some(128),
                        rgb_color: Some([255, 0, 40]),
                        ..Default::default()
                    },
                    transition_ms: 250,
                }],
            },
        ])
    }

    #[test]
    fn export_import_round_trips() {
        let original = sample();
        let json = original.export_json().unwrap();
        let restored = Timeline::import_json(&json).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn exported_document_uses_camel_case_fields() {
        let value: Value = serde_json::from_str(&sample().export_json().unwrap()).unwrap();
        assert_eq!(value["metadata"]["commandCount"], 4);
        assert_eq!(value["audioFeatures"]["mood"], "happy");
        assert_eq!(value["tracks"][1]["commands"][0]["type"], "set_color");
        assert_eq!(value["tracks"][1]["commands"][0]["transitionMs"], 250);
        assert!(value["tracks"][0]["commands"][0]["payload"]
            .get("rgbColor")
            .is_none());
    }

    #[test]
    fn import_rejects_missing_tracks() {
        let err = Timeline::import_json(r#"{ "id": "x", "name": "x" }"#).unwrap_err();
        assert!(err.to_string().contains("tracks"));
    }

    #[test]
    fn import_rejects_non_monotonic_tracks() {
        let mut bad = sample();
        bad.tracks[0].commands.swap(0, 2);
        let json = serde_json::to_string(&bad).unwrap();

        let err = Timeline::import_json(&json).unwrap_err();
        assert!(matches!(err, LightSyncError::Input(_)));
        assert!(err.to_string().contains("not monotonic"));
    }

    #[test]
    fn dispatch_time_is_shifted_and_clamped() {
        let timeline = sample();
        let track = &timeline.tracks[0];
        assert_eq!(track.dispatch_time(&track.commands[0]), 0.0);
        assert!((track.dispatch_time(&track.commands[1]) - 0.38).abs() < 1e-9);
        assert_eq!(track.first_at_or_after(0.4), 2);
        assert_eq!(track.first_at_or_after(0.0), 0);
    }

    #[test]
    fn service_calls_carry_transition_seconds() {
        let command = &sample().tracks[1].commands[0];
        let (service, payload) = command.to_service_call("light.b");
        assert_eq!(service, "turn_on");
        assert_eq!(payload["rgb_color"], json!([255, 0, 40]));
        assert_eq!(payload["transition"], json!(0.25));
    }

    #[test]
    fn capability_checks() {
        let caps = CapabilitySet {
            supports_brightness: true,
            ..Default::default()
        };
        let colour = &sample().tracks[1].commands[0];
        assert!(command(0.0, 1).check_supported("light.a", &caps).is_ok());
        assert!(matches!(
            colour.check_supported("light.a", &caps).unwrap_err(),
            LightSyncError::CapabilityMismatch { .. }
        ));
    }

    #[test]
    fn ids_must_stay_inside_the_store_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut store = TimelineStore::open(root.path().join("timelines")).unwrap();

        let mut escaping = sample();
        escaping.id = "../escaped".to_string();
        let err = store.insert(escaping.clone()).unwrap_err();
        assert!(matches!(err, LightSyncError::Input(_)));
        assert!(!root.path().join("escaped.json").exists());
        assert!(store.list().is_empty());

        let raw = serde_json::to_string(&escaping).unwrap();
        assert!(Timeline::import_json(&raw).is_err());

        for bad in ["a/b", "a\\b", "", ".hidden"] {
            assert!(check_file_key("timeline id", bad).is_err(), "{bad}");
        }
        assert!(check_file_key("entity id", "light.living_room").is_ok());
        assert!(check_file_key("timeline id", "0b7c6a1e-3f2d-4e5a-9c8b-7a6d5e4f3a2b").is_ok());
    }

    #[test]
    fn store_persists_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TimelineStore::open(dir.path()).unwrap();
        store.insert(sample()).unwrap();
        std::fs::write(dir.path().join("junk.json"), "{}").unwrap();

        let reopened = TimelineStore::open(dir.path()).unwrap();
        assert_eq!(reopened.list().len(), 1);
        assert_eq!(*reopened.get("tl-1").unwrap(), sample());

        let mut reopened = reopened;
        assert!(reopened.delete("tl-1").unwrap());
        assert!(!reopened.delete("tl-1").unwrap());
        assert!(!dir.path().join("tl-1.json").exists());
    }
}
