//! Measures how real lights respond to commands: latency, usable fade
//! range, colour fidelity, brightness linearity and effect behaviour.

pub(crate) mod profile;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::{
    config::ProfilerConfig,
    hub::{EntityState, HomeHub},
    mapping::{color, Rgb},
    scanner::LightDevice,
    LightSyncError, Result,
};

pub use profile::{
    needs_reprofiling, BrightnessSample, CalibrationMethod, DeviceProfile, EffectPerformance,
    ProfileStore,
};

const REFERENCE_COLORS: [Rgb; 4] = [[255, 0, 0], [0, 255, 0], [0, 0, 255], [255, 180, 40]];
const LATENCY_TARGETS: [u8; 2] = [255, 77];
const EFFECT_RESET: &str = "none";

/// Outcome of one command-then-poll round.
#[derive(Debug)]
enum Measurement {
    Reached { elapsed_ms: f64, state: EntityState },
    TimedOut,
}

#[derive(Debug, Default)]
struct SampleCounter {
    taken: u32,
    timed_out: u32,
}

impl SampleCounter {
    fn record(&mut self, measurement: &Measurement) {
        self.taken += 1;
        if matches!(measurement, Measurement::TimedOut) {
            self.timed_out += 1;
        }
    }
}

/// Runs bounded measurement rounds against a device through the
/// service-invoke interface.
pub struct DeviceProfiler {
    hub: Arc<dyn HomeHub>,
    config: ProfilerConfig,
}

impl DeviceProfiler {
    pub fn new(hub: Arc<dyn HomeHub>, config: ProfilerConfig) -> Self {
        Self { hub, config }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Profiles `device` with `iterations` rounds per metric.
    ///
    /// Fails only when the device cannot be read at all. A round that times
    /// out contributes the timeout as its latency sample (or the worst score
    /// for quality metrics) and the run carries on.
    pub async fn profile(&self, device: &LightDevice, iterations: usize) -> Result<DeviceProfile> {
        let entity_id = device.entity_id.as_str();
        let iterations = iterations.max(1);
        let initial = self.hub.read_state(entity_id).await.map_err(|e| {
            LightSyncError::upstream(format!("cannot reach `{entity_id}` for profiling: {e}"))
        })?;

        tracing::info!(entity_id, iterations, "profiling device");
        let mut counter = SampleCounter::default();
        let caps = &device.capabilities;

        let latency_samples = self
            .measure_latency(device, &initial, iterations, &mut counter)
            .await;
        let (latency_ms, consistency) = mean_and_std(&latency_samples);

        let (min_transition_ms, max_transition_ms) = if caps.supports_brightness {
            self.measure_transitions(entity_id, iterations, latency_ms, &mut counter)
                .await
        } else {
            (latency_ms.round() as u32, latency_ms.round() as u32)
        };

        let color_accuracy = if caps.supports_color {
            Some(self.measure_color(entity_id, iterations, &mut counter).await)
        } else {
            None
        };

        let (brightness_curve, brightness_linearity) = if caps.supports_brightness {
            let curve = self
                .measure_brightness_curve(entity_id, iterations, &mut counter)
                .await;
            let linearity = r_squared(&curve).unwrap_or(0.0);
            (curve, Some(linearity))
        } else {
            (Vec::new(), None)
        };

        let mut per_effect_performance = BTreeMap::new();
        for effect in caps
            .supported_effects
            .iter()
            .take(self.config.max_effects_probed)
        {
            let performance = self
                .measure_effect(entity_id, effect, iterations, &mut counter)
                .await;
            per_effect_performance.insert(effect.clone(), performance);
        }

        self.restore(&initial).await;

        let profile = DeviceProfile {
            entity_id: entity_id.to_string(),
            latency_ms,
            min_transition_ms,
            max_transition_ms: max_transition_ms.max(min_transition_ms),
            color_accuracy,
            brightness_linearity,
            response_time_consistency: consistency,
            per_effect_performance,
            brightness_curve,
            last_calibrated: Utc::now(),
            calibration_method: CalibrationMethod::Automated,
            samples_taken: counter.taken,
            samples_timed_out: counter.timed_out,
        };

        tracing::info!(
            entity_id,
            latency_ms = profile.latency_ms,
            min_transition_ms = profile.min_transition_ms,
            max_transition_ms = profile.max_transition_ms,
            color_accuracy = profile.color_accuracy,
            brightness_linearity = profile.brightness_linearity,
            timed_out = counter.timed_out,
            "device profiled"
        );
        Ok(profile)
    }

    async fn measure_latency(
        &self,
        device: &LightDevice,
        initial: &EntityState,
        iterations: usize,
        counter: &mut SampleCounter,
    ) -> Vec<f64> {
        let entity_id = device.entity_id.as_str();
        let timeout_ms = self.config.timeout_ms as f64;
        let mut samples = Vec::with_capacity(iterations);

        if device.capabilities.supports_brightness {
            for _ in 0..iterations {
                let measurement = self
                    .measure_toggle(entity_id, 0, self.config.timeout())
                    .await;
                counter.record(&measurement);
                samples.push(match measurement {
                    Measurement::Reached { elapsed_ms, .. } => elapsed_ms,
                    Measurement::TimedOut => timeout_ms,
                });
            }
        } else {
            let mut on = !initial.is_on();
            for _ in 0..iterations {
                let service = if on { "turn_on" } else { "turn_off" };
                let measurement = self
                    .measure(
                        entity_id,
                        service,
                        json!({ "entity_id": entity_id }),
                        self.config.timeout(),
                        |state| state.is_on() == on,
                    )
                    .await;
                counter.record(&measurement);
                samples.push(match measurement {
                    Measurement::Reached { elapsed_ms, .. } => elapsed_ms,
                    Measurement::TimedOut => timeout_ms,
                });
                on = !on;
            }
        }

        samples
    }

    /// Returns (fastest observed completion, longest probe that completed).
    async fn measure_transitions(
        &self,
        entity_id: &str,
        iterations: usize,
        latency_ms: f64,
        counter: &mut SampleCounter,
    ) -> (u32, u32) {
        let mut fastest: Option<f64> = None;
        let mut longest_completed: Option<u64> = None;

        for _ in 0..iterations {
            for &probe in &self.config.transition_probes_ms {
                let timeout = self.config.timeout() + Duration::from_millis(probe);
                let measurement = self.measure_toggle(entity_id, probe, timeout).await;
                counter.record(&measurement);
                if let Measurement::Reached { elapsed_ms, .. } = measurement {
                    fastest = Some(fastest.map_or(elapsed_ms, |f| f.min(elapsed_ms)));
                    longest_completed = Some(longest_completed.map_or(probe, |l| l.max(probe)));
                }
            }
        }

        let min = fastest.unwrap_or(latency_ms).round() as u32;
        let max = longest_completed.map(|l| l as u32).unwrap_or(min);
        (min, max)
    }

    /// Mean accuracy over the reference colours; timed-out rounds score 0.
    async fn measure_color(&self, entity_id: &str, iterations: usize, counter: &mut SampleCounter) -> f32 {
        let mut scores = Vec::new();
        for _ in 0..iterations {
            for reference in REFERENCE_COLORS {
                let before = self.hub.read_state(entity_id).await.ok().and_then(|s| s.rgb_color());
                let measurement = self
                    .measure(
                        entity_id,
                        "turn_on",
                        json!({
                            "entity_id": entity_id,
                            "rgb_color": reference,
                            "brightness": 255,
                            "transition": 0,
                        }),
                        self.config.timeout(),
                        |state| match state.rgb_color() {
                            Some(rgb) => rgb == reference || Some(rgb) != before,
                            None => false,
                        },
                    )
                    .await;
                counter.record(&measurement);
                let score = match &measurement {
                    Measurement::Reached { state, .. } => state
                        .rgb_color()
                        .map(|reported| color::color_accuracy(reference, reported))
                        .unwrap_or(0.0),
                    Measurement::TimedOut => 0.0,
                };
                scores.push(score);
            }
        }
        (scores.iter().sum::<f32>() / scores.len().max(1) as f32).clamp(0.0, 1.0)
    }

    /// Sweeps the configured brightness levels and averages the reported
    /// output per level. Levels that never settle are left out of the curve.
    async fn measure_brightness_curve(
        &self,
        entity_id: &str,
        iterations: usize,
        counter: &mut SampleCounter,
    ) -> Vec<BrightnessSample> {
        let mut readings: BTreeMap<u8, Vec<f32>> = BTreeMap::new();
        for _ in 0..iterations {
            for &level in &self.config.brightness_sweep {
                let measurement = self
                    .measure_brightness(entity_id, level, 0, self.config.timeout())
                    .await;
                counter.record(&measurement);
                if let Measurement::Reached { state, .. } = measurement {
                    if let Some(reported) = state.brightness() {
                        readings.entry(level).or_default().push(reported as f32 / 255.0);
                    }
                }
            }
        }

        readings
            .into_iter()
            .map(|(level, outputs)| BrightnessSample {
                input: level as f32 / 255.0,
                output: outputs.iter().sum::<f32>() / outputs.len() as f32,
            })
            .collect()
    }

    async fn measure_effect(
        &self,
        entity_id: &str,
        effect: &str,
        iterations: usize,
        counter: &mut SampleCounter,
    ) -> EffectPerformance {
        let mut times = Vec::new();
        for _ in 0..iterations {
            let current = self.hub.read_state(entity_id).await.ok();
            if current.as_ref().and_then(|s| s.attr_str("effect")) == Some(effect) {
                let reset = self
                    .measure(
                        entity_id,
                        "turn_on",
                        json!({ "entity_id": entity_id, "effect": EFFECT_RESET }),
                        self.config.timeout(),
                        |state| state.attr_str("effect") != Some(effect),
                    )
                    .await;
                if matches!(reset, Measurement::TimedOut) {
                    tracing::debug!(entity_id, effect, "effect did not reset before probing");
                }
            }

            let measurement = self
                .measure(
                    entity_id,
                    "turn_on",
                    json!({ "entity_id": entity_id, "effect": effect }),
                    self.config.timeout(),
                    |state| state.attr_str("effect") == Some(effect),
                )
                .await;
            counter.record(&measurement);
            if let Measurement::Reached { elapsed_ms, .. } = measurement {
                times.push(elapsed_ms);
            }
        }

        if times.is_empty() {
            return EffectPerformance {
                supported: false,
                response_time_ms: None,
                smoothness: None,
            };
        }
        let (mean, std_dev) = mean_and_std(&times);
        let smoothness = if mean > f64::EPSILON {
            (1.0 - std_dev / mean).clamp(0.0, 1.0) as f32
        } else {
            1.0
        };
        EffectPerformance {
            supported: true,
            response_time_ms: Some(mean),
            smoothness: Some(smoothness),
        }
    }

    /// Drives the light to whichever latency target is further from its
    /// current level, so every round produces a visible change.
    async fn measure_toggle(&self, entity_id: &str, transition_ms: u64, timeout: Duration) -> Measurement {
        let current = self
            .hub
            .read_state(entity_id)
            .await
            .ok()
            .and_then(|s| s.brightness())
            .unwrap_or(0);
        let [high, low] = LATENCY_TARGETS;
        let target = if current.abs_diff(high) <= self.config.brightness_tolerance {
            low
        } else {
            high
        };
        self.measure_brightness(entity_id, target, transition_ms, timeout)
            .await
    }

    /// Commands a brightness level and waits for a visible change toward it.
    async fn measure_brightness(
        &self,
        entity_id: &str,
        target: u8,
        transition_ms: u64,
        timeout: Duration,
    ) -> Measurement {
        let before = self
            .hub
            .read_state(entity_id)
            .await
            .ok()
            .and_then(|s| s.brightness());
        let tolerance = self.config.brightness_tolerance;

        self.measure(
            entity_id,
            "turn_on",
            json!({
                "entity_id": entity_id,
                "brightness": target,
                "transition": transition_ms as f64 / 1000.0,
            }),
            timeout,
            |state| {
                let Some(now) = state.brightness().filter(|_| state.is_on()) else {
                    return false;
                };
                if now.abs_diff(target) <= tolerance {
                    return true;
                }
                match before {
                    Some(prev) if now.abs_diff(prev) > tolerance => {
                        (now > prev) == (target > prev)
                    }
                    _ => false,
                }
            },
        )
        .await
    }

    /// Issues one command, then polls until `reached` holds or `timeout`
    /// elapses. Failed or slow calls count as a timeout for this round only.
    async fn measure<F>(
        &self,
        entity_id: &str,
        service: &str,
        payload: Value,
        timeout: Duration,
        reached: F,
    ) -> Measurement
    where
        F: Fn(&EntityState) -> bool,
    {
        let start = Instant::now();
        let deadline = start + timeout;

        match tokio::time::timeout(timeout, self.hub.invoke_service("light", service, payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(entity_id, %err, "profiling command failed");
                return Measurement::TimedOut;
            }
            Err(_) => {
                tracing::warn!(entity_id, "profiling command timed out");
                return Measurement::TimedOut;
            }
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::debug!(entity_id, service, "device did not reach target state");
                return Measurement::TimedOut;
            }

            match tokio::time::timeout(remaining, self.hub.read_state(entity_id)).await {
                Ok(Ok(state)) if reached(&state) => {
                    return Measurement::Reached {
                        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
                        state,
                    };
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::debug!(entity_id, %err, "state poll failed"),
                Err(_) => return Measurement::TimedOut,
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.poll_interval().min(remaining)).await;
        }
    }

    async fn invoke_best_effort(&self, service: &str, payload: Value) {
        let call = self.hub.invoke_service("light", service, payload);
        match tokio::time::timeout(self.config.timeout(), call).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(%err, service, "best-effort command failed"),
            Err(_) => tracing::warn!(service, "best-effort command timed out"),
        }
    }

    /// Puts the light back the way profiling found it.
    async fn restore(&self, initial: &EntityState) {
        let entity_id = initial.entity_id.as_str();
        if !initial.is_on() {
            self.invoke_best_effort("turn_off", json!({ "entity_id": entity_id }))
                .await;
            return;
        }

        let mut payload = json!({ "entity_id": entity_id });
        if let Some(brightness) = initial.attr_u64("brightness") {
            payload["brightness"] = json!(brightness);
        }
        if let Some(rgb) = initial.rgb_color() {
            payload["rgb_color"] = json!(rgb);
        }
        self.invoke_best_effort("turn_on", payload).await;
    }
}

impl std::fmt::Debug for DeviceProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProfiler")
            .field("config", &self.config)
            .finish()
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

/// Goodness of fit of a least-squares line through the curve, clamped to
/// [0, 1]. `None` with fewer than two distinct inputs.
fn r_squared(curve: &[BrightnessSample]) -> Option<f32> {
    if curve.len() < 2 {
        return None;
    }
    let n = curve.len() as f32;
    let mean_x = curve.iter().map(|s| s.input).sum::<f32>() / n;
    let mean_y = curve.iter().map(|s| s.output).sum::<f32>() / n;

    let sxx: f32 = curve.iter().map(|s| (s.input - mean_x).powi(2)).sum();
    if sxx <= f32::EPSILON {
        return None;
    }
    let sxy: f32 = curve
        .iter()
        .map(|s| (s.input - mean_x) * (s.output - mean_y))
        .sum();
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let ss_tot: f32 = curve.iter().map(|s| (s.output - mean_y).powi(2)).sum();
    let ss_res: f32 = curve
        .iter()
        .map(|s| (s.output - (slope * s.input + intercept)).powi(2))
        .sum();

    if ss_tot <= f32::EPSILON {
        return Some(if ss_res <= f32::EPSILON { 1.0 } else { 0.0 });
    }
    Some((1.0 - ss_res / ss_tot).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hub::{SimulatedHub, SimulatedLight},
        scanner::{CapabilitySet, LightDevice},
    };

    async fn device(hub: &SimulatedHub, entity_id: &str) -> LightDevice {
        let states = hub.read_states().await.unwrap();
        let state = states.iter().find(|s| s.entity_id == entity_id).unwrap();
        LightDevice::from_state(state)
    }

    fn profiler(hub: Arc<SimulatedHub>) -> DeviceProfiler {
        DeviceProfiler::new(hub, ProfilerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn measures_latency_of_responsive_light() {
        let hub = Arc::new(SimulatedHub::new(vec![SimulatedLight::new("light.a", "A")
            .with_response_delay(Duration::from_millis(150))]));
        let light = device(&hub, "light.a").await;

        let profile = profiler(hub.clone()).profile(&light, 3).await.unwrap();

        assert!((150.0..=200.0).contains(&profile.latency_ms), "{}", profile.latency_ms);
        assert!(profile.response_time_consistency < 1.0);
        assert_eq!(profile.color_accuracy, None);
        assert_eq!(profile.brightness_linearity.map(|l| l > 0.99), Some(true));
        assert_eq!(profile.samples_timed_out, 0);
        assert!(profile.min_transition_ms >= 150);
        assert_eq!(profile.max_transition_ms, 2_000);
        assert!(profile.validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_light_reports_timeout_ceiling() {
        let hub = Arc::new(SimulatedHub::new(vec![SimulatedLight::new("light.dead", "Dead")
            .with_color_modes(&["hs"])
            .unresponsive()]));
        let light = device(&hub, "light.dead").await;

        let profile = profiler(hub.clone()).profile(&light, 2).await.unwrap();

        assert_eq!(profile.latency_ms, 3_000.0);
        assert_eq!(profile.color_accuracy, Some(0.0));
        assert!(profile.brightness_curve.is_empty());
        assert_eq!(profile.samples_timed_out, profile.samples_taken);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_light_fails_outright() {
        let hub = Arc::new(SimulatedHub::new(vec![SimulatedLight::new("light.a", "A")]));
        let light = device(&hub, "light.a").await;
        let missing = LightDevice {
            entity_id: "light.missing".to_string(),
            ..light
        };

        let err = profiler(hub).profile(&missing, 1).await.unwrap_err();
        assert!(matches!(err, LightSyncError::Upstream(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn scores_colour_and_brightness_fidelity() {
        let hub = Arc::new(SimulatedHub::new(vec![
            SimulatedLight::new("light.true", "True").with_color_modes(&["rgb"]),
            SimulatedLight::new("light.off", "Off")
                .with_color_modes(&["rgb"])
                .with_color_shift([-60, 40, 60])
                .with_brightness_gamma(2.2),
        ]));
        let profiler = profiler(hub.clone());

        let good = profiler.profile(&device(&hub, "light.true").await, 1).await.unwrap();
        let bad = profiler.profile(&device(&hub, "light.off").await, 1).await.unwrap();

        assert!(good.color_accuracy.unwrap() > 0.99);
        assert!(bad.color_accuracy.unwrap() < good.color_accuracy.unwrap());
        assert!(bad.brightness_linearity.unwrap() < good.brightness_linearity.unwrap());
        assert_eq!(good.brightness_curve.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn probes_supported_effects() {
        let hub = Arc::new(SimulatedHub::new(vec![SimulatedLight::new("light.fx", "Fx")
            .with_effects(&["colorloop", "strobe"])]));
        let light = device(&hub, "light.fx").await;

        let profile = profiler(hub.clone()).profile(&light, 2).await.unwrap();
        let loop_perf = &profile.per_effect_performance["colorloop"];

        assert!(loop_perf.supported);
        assert!(loop_perf.response_time_ms.unwrap() >= 100.0);
        assert_eq!(profile.per_effect_performance.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn on_off_lights_skip_quality_metrics() {
        let hub = Arc::new(SimulatedHub::new(vec![
            SimulatedLight::new("light.plug", "Plug").with_color_modes(&["onoff"])
        ]));
        let light = device(&hub, "light.plug").await;
        assert_eq!(light.capabilities, CapabilitySet::default());

        let profile = profiler(hub.clone()).profile(&light, 2).await.unwrap();

        assert!(profile.latency_ms >= 100.0 && profile.latency_ms < 3_000.0);
        assert_eq!(profile.color_accuracy, None);
        assert_eq!(profile.brightness_linearity, None);
        assert!(profile.per_effect_performance.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restores_initial_state() {
        let hub = Arc::new(SimulatedHub::new(vec![SimulatedLight::new("light.a", "A")]));
        let light = device(&hub, "light.a").await;
        profiler(hub.clone()).profile(&light, 1).await.unwrap();

        let last = hub.invocations().pop().unwrap();
        assert_eq!(last.service, "turn_off");
    }

    #[test]
    fn r_squared_of_perfect_and_curved_data() {
        let line: Vec<_> = (0..5)
            .map(|i| BrightnessSample {
                input: i as f32 / 4.0,
                output: i as f32 / 4.0,
            })
            .collect();
        assert!((r_squared(&line).unwrap() - 1.0).abs() < 1e-6);

        let curved: Vec<_> = line
            .iter()
            .map(|s| BrightnessSample {
                input: s.input,
                output: s.input.powi(4),
            })
            .collect();
        assert!(r_squared(&curved).unwrap() < 0.95);
        assert_eq!(r_squared(&line[..1]), None);
    }
}
