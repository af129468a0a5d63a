use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{generator::GenerationSettings, LightSyncError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub analysis: AnalysisConfig,
    pub hub: HubConfig,
    pub profiler: ProfilerConfig,
    pub generation: GenerationSettings,
    pub playback: PlaybackConfig,
}

impl AppConfig {
    /// Reads a JSON configuration document. Missing sections and fields fall
    /// back to their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!(?path, "loaded configuration");
        Ok(config)
    }

    /// Checks every section.
    pub fn validate(&self) -> Result<()> {
        self.analysis.validate()?;
        if self.playback.max_queue_depth == 0 {
            return Err(LightSyncError::input("playback.max_queue_depth must be > 0"));
        }
        if self.playback.tick_interval_ms == 0 {
            return Err(LightSyncError::input("playback.tick_interval_ms must be > 0"));
        }
        if self.profiler.poll_interval_ms == 0 {
            return Err(LightSyncError::input("profiler.poll_interval_ms must be > 0"));
        }
        Ok(())
    }
}

/// Configuration specific to the audio analysis subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub fft_size: usize,
    pub hop_size: usize,
    /// Windows whose RMS amplitude falls below this level are silence.
    pub noise_floor: f32,
    /// Hard ceiling on audio payloads, local or remote.
    pub max_audio_bytes: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            hop_size: 1024,
            noise_floor: 0.01,
            max_audio_bytes: 50 * 1024 * 1024,
            fetch_timeout_secs: 60,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fft_size < 2 {
            return Err(LightSyncError::input("fft_size must be at least 2"));
        }
        if self.hop_size == 0 || self.hop_size >= self.fft_size {
            return Err(LightSyncError::input(format!(
                "hop_size ({}) must be non-zero and smaller than fft_size ({})",
                self.hop_size, self.fft_size
            )));
        }
        Ok(())
    }
}

/// Connection settings for the home-automation REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub base_url: String,
    /// Name of the environment variable holding the access token.
    pub token_env: String,
    pub request_timeout_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: "http://homeassistant.local:8123".to_string(),
            token_env: "LIGHTSYNC_HUB_TOKEN".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}

impl HubConfig {
    /// Reads the bearer token from the configured environment variable.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok().filter(|t| !t.is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub iterations: usize,
    /// Ceiling for a single measurement; also the worst-case latency sample.
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Transition durations probed when measuring fade bounds.
    pub transition_probes_ms: Vec<u64>,
    /// Commanded brightness levels (0-255) for the linearity sweep.
    pub brightness_sweep: Vec<u8>,
    /// Brightness tolerance (0-255) when deciding a target was reached.
    pub brightness_tolerance: u8,
    pub max_effects_probed: usize,
    pub reprofile_interval_days: u32,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            iterations: 3,
            timeout_ms: 3_000,
            poll_interval_ms: 50,
            transition_probes_ms: vec![0, 250, 1_000, 2_000],
            brightness_sweep: vec![26, 64, 128, 192, 255],
            brightness_tolerance: 3,
            max_effects_probed: 4,
            reprofile_interval_days: 30,
        }
    }
}

impl ProfilerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub tick_interval_ms: u64,
    pub lookahead_ms: u64,
    /// Per-device bound on commands waiting to be sent, counting the one a
    /// device lane holds while it waits out spacing or a permit.
    pub max_queue_depth: usize,
    /// Minimum spacing between two sends to the same device.
    pub min_command_interval_ms: u64,
    pub dispatch_timeout_ms: u64,
    pub max_concurrent_dispatches: usize,
    /// Commands whose dispatch time lies further behind the clock than this
    /// are skipped instead of sent late.
    pub stale_tolerance_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 20,
            lookahead_ms: 100,
            max_queue_depth: 8,
            min_command_interval_ms: 50,
            dispatch_timeout_ms: 1_500,
            max_concurrent_dispatches: 16,
            stale_tolerance_ms: 500,
        }
    }
}

impl PlaybackConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn lookahead_seconds(&self) -> f64 {
        self.lookahead_ms as f64 / 1000.0
    }

    pub fn stale_tolerance_seconds(&self) -> f64 {
        self.stale_tolerance_ms as f64 / 1000.0
    }

    pub fn min_command_interval(&self) -> Duration {
        Duration::from_millis(self.min_command_interval_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fall_back_to_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{ "playback": { "max_queue_depth": 4 } }"#).unwrap();

        assert_eq!(config.playback.max_queue_depth, 4);
        assert_eq!(config.playback.tick_interval_ms, 20);
        assert_eq!(config.analysis.fft_size, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_hop_not_smaller_than_fft() {
        let analysis = AnalysisConfig {
            fft_size: 512,
            hop_size: 512,
            ..Default::default()
        };
        assert!(analysis.validate().is_err());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "profiler": { "timeout_ms": 900 } }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.profiler.timeout_ms, 900);
        assert_eq!(config.profiler.iterations, 3);
    }
}
