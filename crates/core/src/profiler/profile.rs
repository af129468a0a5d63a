use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{timeline::check_file_key, LightSyncError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMethod {
    /// Measured by the profiler against the live device.
    Automated,
    /// Entered or edited by hand.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectPerformance {
    pub supported: bool,
    pub response_time_ms: Option<f64>,
    /// 1.0 when repeated activations respond in identical time.
    pub smoothness: Option<f32>,
}

/// Normalised commanded vs. reported brightness, both in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrightnessSample {
    pub input: f32,
    pub output: f32,
}

/// Measured response characteristics of one light. Profiles are replaced,
/// never edited: re-profiling produces a new value.
///
/// `color_accuracy` and `brightness_linearity` are `None` when the device
/// lacks the capability, which keeps "not measurable" apart from "measured
/// as poor".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub entity_id: String,
    pub latency_ms: f64,
    pub min_transition_ms: u32,
    pub max_transition_ms: u32,
    pub color_accuracy: Option<f32>,
    pub brightness_linearity: Option<f32>,
    /// Standard deviation of the latency samples.
    pub response_time_consistency: f64,
    pub per_effect_performance: BTreeMap<String, EffectPerformance>,
    pub brightness_curve: Vec<BrightnessSample>,
    pub last_calibrated: DateTime<Utc>,
    pub calibration_method: CalibrationMethod,
    #[serde(default)]
    pub samples_taken: u32,
    #[serde(default)]
    pub samples_timed_out: u32,
}

impl DeviceProfile {
    /// True once strictly more than `interval_days` have passed since
    /// calibration.
    pub fn needs_reprofiling_at(&self, interval_days: u32, now: DateTime<Utc>) -> bool {
        now - self.last_calibrated > Duration::days(i64::from(interval_days))
    }

    /// Rejects ids that are not plain names and out-of-range metrics.
    pub fn validate(&self) -> Result<()> {
        check_file_key("entity id", &self.entity_id)?;
        let unit = |value: Option<f32>| value.map_or(true, |v| (0.0..=1.0).contains(&v));
        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(LightSyncError::input(format!(
                "profile for `{}` has negative latency",
                self.entity_id
            )));
        }
        if !unit(self.color_accuracy) || !unit(self.brightness_linearity) {
            return Err(LightSyncError::input(format!(
                "profile for `{}` has accuracy or linearity outside [0, 1]",
                self.entity_id
            )));
        }
        if self.min_transition_ms > self.max_transition_ms {
            return Err(LightSyncError::input(format!(
                "profile for `{}` has min transition above max",
                self.entity_id
            )));
        }
        Ok(())
    }

    /// Commanded brightness (normalised) expected to produce `desired`
    /// visible brightness, read off the measured curve. Identity when no
    /// curve was captured.
    pub fn brightness_input_for(&self, desired: f32) -> f32 {
        let desired = desired.clamp(0.0, 1.0);
        let mut curve: Vec<BrightnessSample> = self.brightness_curve.clone();
        if curve.len() < 2 {
            return desired;
        }
        curve.sort_by(|a, b| a.output.total_cmp(&b.output));

        let first = curve[0];
        let last = curve[curve.len() - 1];
        if desired <= first.output {
            return if first.output > f32::EPSILON {
                first.input * desired / first.output
            } else {
                first.input
            };
        }
        if desired >= last.output {
            return last.input;
        }

        for pair in curve.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if desired >= lo.output && desired <= hi.output {
                let span = hi.output - lo.output;
                if span <= f32::EPSILON {
                    return lo.input;
                }
                let t = (desired - lo.output) / span;
                return lo.input + (hi.input - lo.input) * t;
            }
        }
        desired
    }

    /// Pretty JSON with `lastCalibrated` as RFC 3339.
    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses and validates an exported profile.
    pub fn import_json(raw: &str) -> Result<Self> {
        let profile: DeviceProfile = serde_json::from_str(raw)
            .map_err(|e| LightSyncError::input(format!("malformed device profile: {e}")))?;
        profile.validate()?;
        Ok(profile)
    }
}

/// Pure staleness check against the current wall clock.
pub fn needs_reprofiling(profile: &DeviceProfile, interval_days: u32) -> bool {
    profile.needs_reprofiling_at(interval_days, Utc::now())
}

/// One profile per entity, optionally mirrored to `<dir>/<entity_id>.json`.
#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: BTreeMap<String, DeviceProfile>,
    dir: Option<PathBuf>,
}

impl ProfileStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads every profile in `dir`, creating it if needed. Unreadable
    /// files are skipped with a warning.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut profiles = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(LightSyncError::from)
                .and_then(|raw| DeviceProfile::import_json(&raw))
            {
                Ok(profile) => {
                    profiles.insert(profile.entity_id.clone(), profile);
                }
                Err(err) => tracing::warn!(?path, %err, "skipping unreadable profile"),
            }
        }

        Ok(Self {
            profiles,
            dir: Some(dir),
        })
    }

    /// Stores `profile`, replacing any earlier profile for the same entity.
    pub fn insert(&mut self, profile: DeviceProfile) -> Result<()> {
        profile.validate()?;
        if let Some(dir) = &self.dir {
            std::fs::write(
                Self::path_for(dir, &profile.entity_id),
                profile.export_json()?,
            )?;
        }
        self.profiles.insert(profile.entity_id.clone(), profile);
        Ok(())
    }

    /// Profile for `entity_id`, if one was measured.
    pub fn get(&self, entity_id: &str) -> Option<&DeviceProfile> {
        self.profiles.get(entity_id)
    }

    pub fn profiles(&self) -> &BTreeMap<String, DeviceProfile> {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Entities whose profile is older than `interval_days` at `now`.
    pub fn stale(&self, interval_days: u32, now: DateTime<Utc>) -> Vec<&str> {
        self.profiles
            .values()
            .filter(|p| p.needs_reprofiling_at(interval_days, now))
            .map(|p| p.entity_id.as_str())
            .collect()
    }

    fn path_for(dir: &Path, entity_id: &str) -> PathBuf {
        dir.join(format!("{entity_id}.json"))
    }
}
