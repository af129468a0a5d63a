//! Core library for the LightSync audio-to-light engine.
//!
//! Audio is analysed into frequency slices, beats and a mood; lights found
//! on the home hub are profiled for latency and fidelity; the generator
//! combines both into a per-device [`Timeline`] that the scheduler plays back
//! in real time. Each module owns one stage of that pipeline and talks to
//! devices only through the [`HomeHub`] trait.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod generator;
pub mod hub;
pub mod mapping;
pub mod profiler;
pub mod scanner;
pub mod scheduler;
pub mod session;
pub mod ticker;
pub mod timeline;

pub use analysis::{AudioAnalyzer, AudioFeatures, FrequencySlice, Mood};
pub use audio::{AudioLocation, DecodedAudio, InputSource, ReplaySource};
pub use config::{AnalysisConfig, AppConfig, HubConfig, PlaybackConfig, ProfilerConfig};
pub use error::{LightSyncError, Result};
pub use generator::{GeneratedTimeline, GenerationSettings, GenerationStats, TimelineGenerator};
pub use hub::{EntityState, HomeHub, HttpHub, SimulatedHub, SimulatedLight};
pub use mapping::{ColorMapping, Rgb};
pub use profiler::{needs_reprofiling, DeviceProfile, DeviceProfiler, ProfileStore};
pub use scanner::{Capability, CapabilitySet, DeviceScanner, LightDevice, ScanFilter};
pub use scheduler::{DispatchStats, PlaybackClock, PlaybackScheduler, PlaybackSession, PlaybackStatus};
pub use session::{AnimationKind, AnimationSpec, ControlResponse, SessionStore};
pub use ticker::PeriodicTicker;
pub use timeline::{Command, CommandType, Timeline, TimelineStore, Track};
