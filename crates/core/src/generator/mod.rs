//! Turns analysed audio plus device knowledge into a [`Timeline`].

use std::cmp::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{AudioFeatures, FrequencySlice},
    mapping::{self, color, ColorMapping, Rgb},
    profiler::{DeviceProfile, ProfileStore},
    scanner::LightDevice,
    timeline::{Command, CommandPayload, CommandType, Timeline, TimelineAudio, TimelineMetadata, Track},
    LightSyncError, Result,
};

/// Knobs for one generation run. Stored in the timeline metadata so an
/// exported show records how it was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationSettings {
    pub name: Option<String>,
    /// 0.0 holds every light at the baseline, 1.0 follows the music fully.
    pub intensity: f32,
    pub color_mapping: ColorMapping,
    /// Add a command at every detected beat on top of the slice grid.
    pub beat_sync: bool,
    /// Fade into each command over the gap to the next one.
    pub smooth_transitions: bool,
    /// Updates closer than this to the previous command are merged away.
    pub min_command_interval_ms: u32,
    pub baseline_brightness: u8,
    pub baseline_color: Rgb,
    pub baseline_color_temp_kelvin: u16,
    /// Extra brightness added on beats, before intensity scaling.
    pub beat_boost: f32,
    /// On/off-only lights switch on at or above this level.
    pub on_off_threshold: f32,
    /// Colour lights whose profiled accuracy falls below this are driven by
    /// brightness (or colour temperature) only.
    pub min_color_accuracy: f32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            name: None,
            intensity: 0.8,
            color_mapping: ColorMapping::default(),
            beat_sync: true,
            smooth_transitions: true,
            min_command_interval_ms: 100,
            baseline_brightness: 128,
            baseline_color: color::WHITE,
            baseline_color_temp_kelvin: 4_000,
            beat_boost: 0.25,
            on_off_threshold: 0.5,
            min_color_accuracy: 0.3,
        }
    }
}

impl GenerationSettings {
    /// Rejects intensity outside [0, 1], a negative beat boost and an empty
    /// custom palette.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.intensity) {
            return Err(LightSyncError::input(format!(
                "intensity must be within [0, 1], got {}",
                self.intensity
            )));
        }
        if !self.beat_boost.is_finite() || self.beat_boost < 0.0 {
            return Err(LightSyncError::input("beat boost must be non-negative"));
        }
        self.color_mapping.validate()
    }

    fn min_interval_seconds(&self) -> f64 {
        self.min_command_interval_ms as f64 / 1000.0
    }
}

/// Per-device figures reported after generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    pub entity_id: String,
    pub commands: usize,
    /// Updates dropped by the minimum command interval.
    pub merged: usize,
    /// How far ahead of the audio this device's commands are dispatched.
    pub compensation_ms: f64,
    pub profiled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStats {
    pub command_count: usize,
    pub devices: Vec<DeviceStats>,
}

#[derive(Debug, Clone)]
pub struct GeneratedTimeline {
    pub timeline: Timeline,
    pub stats: GenerationStats,
}

/// A point in the audio where a command may be emitted.
#[derive(Debug, Clone, Copy)]
struct Event {
    time: f64,
    slice: FrequencySlice,
    beat: bool,
}

/// How a light will be driven, resolved once from its capabilities and
/// profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drive {
    Color,
    ColorTemp,
    Brightness,
    OnOff,
}

impl Drive {
    fn resolve(device: &LightDevice, profile: Option<&DeviceProfile>, settings: &GenerationSettings) -> Self {
        let caps = &device.capabilities;
        let color_usable = profile
            .and_then(|p| p.color_accuracy)
            .map_or(true, |accuracy| accuracy >= settings.min_color_accuracy);

        if caps.supports_color && color_usable {
            Drive::Color
        } else if caps.supports_color_temp {
            Drive::ColorTemp
        } else if caps.supports_brightness {
            Drive::Brightness
        } else {
            Drive::OnOff
        }
    }
}

/// Builds timelines from analysed audio, a device list and the profiles
/// measured for those devices.
#[derive(Debug, Clone, Default)]
pub struct TimelineGenerator {
    settings: GenerationSettings,
}

impl TimelineGenerator {
    /// Fails when `settings` do not validate.
    pub fn new(settings: GenerationSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    /// Produces one track per device. Command timestamps are audio time;
    /// each track carries its device's latency so dispatch happens early by
    /// that amount. Devices without a profile are not compensated.
    pub fn generate(
        &self,
        features: &AudioFeatures,
        devices: &[LightDevice],
        profiles: &ProfileStore,
    ) -> Result<GeneratedTimeline> {
        if devices.is_empty() {
            return Err(LightSyncError::input("no devices to generate a timeline for"));
        }

        let events = self.collect_events(features);
        let (emitted, merged) = self.thin_events(&events);
        let peak = features.peak_amplitude();

        let mut tracks = Vec::with_capacity(devices.len());
        let mut stats = GenerationStats::default();

        for device in devices {
            let profile = profiles.get(&device.entity_id);
            let drive = Drive::resolve(device, profile, &self.settings);
            let latency_ms = profile.map_or(0.0, |p| p.latency_ms);

            let mut commands: Vec<Command> = emitted
                .iter()
                .map(|event| self.command_for(event, drive, peak, features, profile))
                .collect();
            self.assign_transitions(&mut commands, features.duration as f64, profile);

            for command in &commands {
                command.check_supported(&device.entity_id, &device.capabilities)?;
            }

            tracing::debug!(
                entity_id = %device.entity_id,
                ?drive,
                commands = commands.len(),
                latency_ms,
                "generated track"
            );
            stats.devices.push(DeviceStats {
                entity_id: device.entity_id.clone(),
                commands: commands.len(),
                merged,
                compensation_ms: latency_ms,
                profiled: profile.is_some(),
            });
            tracks.push(Track {
                entity_id: device.entity_id.clone(),
                latency_ms,
                commands,
            });
        }

        let command_count = tracks.iter().map(|t| t.commands.len()).sum();
        stats.command_count = command_count;

        let name = self
            .settings
            .name
            .clone()
            .unwrap_or_else(|| format!("Light show {}", Utc::now().format("%Y-%m-%d %H:%M")));
        let timeline = Timeline {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            duration: features.duration as f64,
            audio_source: None,
            audio_features: TimelineAudio {
                bpm: features.bpm,
                beats: features.beats.clone(),
                mood: features.mood,
            },
            tracks,
            metadata: TimelineMetadata {
                command_count,
                settings: self.settings.clone(),
                created_at: Some(Utc::now()),
            },
        };
        timeline.validate()?;

        tracing::info!(
            timeline_id = %timeline.id,
            devices = devices.len(),
            command_count,
            merged,
            "timeline generated"
        );
        Ok(GeneratedTimeline { timeline, stats })
    }

    /// Slice starts plus, with beat sync, every beat. Beats sort ahead of a
    /// slice at the same instant so they survive thinning.
    fn collect_events(&self, features: &AudioFeatures) -> Vec<Event> {
        let mut events: Vec<Event> = features
            .slices
            .iter()
            .map(|slice| Event {
                time: slice.timestamp as f64,
                slice: *slice,
                beat: false,
            })
            .collect();

        if self.settings.beat_sync {
            events.extend(features.beats.iter().filter_map(|&beat| {
                features.slice_at(beat).map(|slice| Event {
                    time: beat as f64,
                    slice: *slice,
                    beat: true,
                })
            }));
        }

        events.sort_by(|a, b| match a.time.total_cmp(&b.time) {
            Ordering::Equal => b.beat.cmp(&a.beat),
            other => other,
        });
        events
    }

    /// Drops events closer than the minimum interval to the last kept one.
    /// A beat displaces a grid slice kept just before it, so beats always
    /// land. Depends only on timing, so every device and every intensity
    /// sees the same command grid.
    fn thin_events(&self, events: &[Event]) -> (Vec<Event>, usize) {
        let min_interval = self.settings.min_interval_seconds();
        let mut kept: Vec<Event> = Vec::with_capacity(events.len());
        let mut merged = 0;
        for event in events {
            match kept.last_mut() {
                Some(last) if event.time - last.time < min_interval - 1e-6 => {
                    if event.beat && !last.beat {
                        *last = *event;
                    }
                    merged += 1;
                }
                _ => kept.push(*event),
            }
        }
        (kept, merged)
    }

    /// Target level in [0, 1] before intensity scaling.
    fn level_for(&self, event: &Event, peak: f32) -> f32 {
        let relative = if peak > f32::EPSILON {
            event.slice.amplitude / peak
        } else {
            0.0
        };
        let mut level = 0.6 * relative + 0.4 * event.slice.bass;
        if event.beat {
            level += self.settings.beat_boost;
        }
        level.clamp(0.0, 1.0)
    }

    fn command_for(
        &self,
        event: &Event,
        drive: Drive,
        peak: f32,
        features: &AudioFeatures,
        profile: Option<&DeviceProfile>,
    ) -> Command {
        let intensity = self.settings.intensity;
        let baseline = self.settings.baseline_brightness as f32 / 255.0;
        let target = baseline + (self.level_for(event, peak) - baseline) * intensity;
        let corrected = profile.map_or(target, |p| p.brightness_input_for(target));
        let brightness = (corrected.clamp(0.0, 1.0) * 255.0).round() as u8;

        let (command_type, payload) = match drive {
            Drive::Color => {
                let wanted = self.settings.color_mapping.color_for(&event.slice, features.mood);
                let rgb = color::lerp_rgb(self.settings.baseline_color, wanted, intensity);
                (
                    CommandType::SetColor,
                    CommandPayload {
                        brightness: Some(brightness),
                        rgb_color: Some(rgb),
                        ..Default::default()
                    },
                )
            }
            Drive::ColorTemp => {
                let base = self.settings.baseline_color_temp_kelvin as f32;
                let wanted = mapping::color_temp_for(&event.slice) as f32;
                let kelvin = (base + (wanted - base) * intensity).round() as u16;
                (
                    CommandType::SetColorTemp,
                    CommandPayload {
                        brightness: Some(brightness),
                        color_temp_kelvin: Some(kelvin),
                        ..Default::default()
                    },
                )
            }
            Drive::Brightness => (
                CommandType::SetBrightness,
                CommandPayload {
                    brightness: Some(brightness),
                    ..Default::default()
                },
            ),
            Drive::OnOff if target >= self.settings.on_off_threshold => {
                (CommandType::TurnOn, CommandPayload::default())
            }
            Drive::OnOff => (CommandType::TurnOff, CommandPayload::default()),
        };

        Command {
            timestamp_seconds: event.time,
            command_type,
            payload,
            transition_ms: 0,
        }
    }

    /// Smooth transitions bridge to the next command, bounded by the fade
    /// range this device was measured to handle.
    fn assign_transitions(&self, commands: &mut [Command], duration: f64, profile: Option<&DeviceProfile>) {
        if !self.settings.smooth_transitions {
            return;
        }
        let next_times: Vec<f64> = commands
            .iter()
            .skip(1)
            .map(|c| c.timestamp_seconds)
            .chain(std::iter::once(duration))
            .collect();

        for (command, next) in commands.iter_mut().zip(next_times) {
            let gap_ms = ((next - command.timestamp_seconds).max(0.0) * 1000.0).round() as u32;
            command.transition_ms = match profile {
                Some(p) => gap_ms.clamp(p.min_transition_ms, p.max_transition_ms.max(p.min_transition_ms)),
                None => gap_ms,
            };
        }
    }
}
