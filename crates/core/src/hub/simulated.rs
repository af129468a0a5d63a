use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use super::{EntityState, HomeHub};
use crate::{LightSyncError, Result};

/// A service call received by the [`SimulatedHub`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub domain: String,
    pub service: String,
    pub payload: Value,
    pub at: Instant,
}

impl Invocation {
    pub fn entity_id(&self) -> Option<&str> {
        self.payload.get("entity_id").and_then(Value::as_str)
    }
}

/// Behaviour of one simulated light.
#[derive(Debug, Clone)]
pub struct SimulatedLight {
    pub state: EntityState,
    /// Delay between a command arriving and the state reflecting it.
    pub response_delay: Duration,
    /// Accepts commands but never changes state.
    pub unresponsive: bool,
    /// Every read and invoke fails as if the device were unreachable.
    pub offline: bool,
    /// Added to each commanded RGB channel before it is reported back.
    pub color_shift: [i16; 3],
    /// Reported brightness is `255 * (commanded / 255) ^ gamma`.
    pub brightness_gamma: f32,
}

impl SimulatedLight {
    /// A dimmable light that is currently off.
    pub fn new(entity_id: &str, name: &str) -> Self {
        let state = EntityState::new(entity_id, "off")
            .with_attribute("friendly_name", json!(name))
            .with_attribute("supported_color_modes", json!(["brightness"]));
        Self {
            state,
            response_delay: Duration::from_millis(100),
            unresponsive: false,
            offline: false,
            color_shift: [0; 3],
            brightness_gamma: 1.0,
        }
    }

    pub fn with_color_modes(mut self, modes: &[&str]) -> Self {
        self.state
            .attributes
            .insert("supported_color_modes".to_string(), json!(modes));
        self
    }

    pub fn with_effects(mut self, effects: &[&str]) -> Self {
        self.state
            .attributes
            .insert("effect_list".to_string(), json!(effects));
        self
    }

    pub fn with_area(mut self, area: &str) -> Self {
        self.state
            .attributes
            .insert("area_id".to_string(), json!(area));
        self
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn with_color_shift(mut self, shift: [i16; 3]) -> Self {
        self.color_shift = shift;
        self
    }

    pub fn with_brightness_gamma(mut self, gamma: f32) -> Self {
        self.brightness_gamma = gamma;
        self
    }

    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    fn apply_command(&self, service: &str, payload: &Value) -> (String, Map<String, Value>) {
        let mut attributes = self.state.attributes.clone();
        if service == "turn_off" {
            return ("off".to_string(), attributes);
        }

        let brightness = payload
            .get("brightness")
            .and_then(Value::as_u64)
            .or_else(|| self.state.attr_u64("brightness"))
            .unwrap_or(255)
            .min(255);
        let reported = (255.0 * (brightness as f32 / 255.0).powf(self.brightness_gamma)).round();
        attributes.insert("brightness".to_string(), json!(reported as u64));

        if let Some(rgb) = payload.get("rgb_color").and_then(Value::as_array) {
            let shifted: Vec<u64> = rgb
                .iter()
                .zip(self.color_shift)
                .map(|(value, shift)| {
                    (value.as_i64().unwrap_or(0) + shift as i64).clamp(0, 255) as u64
                })
                .collect();
            attributes.insert("rgb_color".to_string(), json!(shifted));
        }
        if let Some(kelvin) = payload.get("color_temp_kelvin") {
            attributes.insert("color_temp_kelvin".to_string(), kelvin.clone());
        }
        if let Some(effect) = payload.get("effect") {
            attributes.insert("effect".to_string(), effect.clone());
        }

        ("on".to_string(), attributes)
    }
}

struct Pending {
    ready_at: Instant,
    state: String,
    attributes: Map<String, Value>,
}

struct LightSlot {
    light: SimulatedLight,
    pending: Option<Pending>,
}

impl LightSlot {
    fn settle(&mut self, now: Instant) {
        if self.pending.as_ref().is_some_and(|p| p.ready_at <= now) {
            if let Some(pending) = self.pending.take() {
                self.light.state.state = pending.state;
                self.light.state.attributes = pending.attributes;
            }
        }
    }
}

/// In-memory stand-in for the home-automation platform. Lights change state
/// after their configured delay measured on the tokio clock, so tests can
/// run with paused time. Every service call is recorded.
pub struct SimulatedHub {
    lights: Mutex<BTreeMap<String, LightSlot>>,
    others: Vec<EntityState>,
    invocations: Mutex<Vec<Invocation>>,
    invoke_latency: Duration,
    fail_reads: AtomicBool,
}

impl SimulatedHub {
    /// A hub exposing `lights` with instant service calls.
    pub fn new(lights: Vec<SimulatedLight>) -> Self {
        let lights = lights
            .into_iter()
            .map(|light| {
                (
                    light.state.entity_id.clone(),
                    LightSlot {
                        light,
                        pending: None,
                    },
                )
            })
            .collect();
        Self {
            lights: Mutex::new(lights),
            others: Vec::new(),
            invocations: Mutex::new(Vec::new()),
            invoke_latency: Duration::ZERO,
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Adds non-light entities that show up in `read_states`.
    pub fn with_entities(mut self, entities: Vec<EntityState>) -> Self {
        self.others = entities;
        self
    }

    /// Delay every service call by `latency` before it is accepted.
    pub fn with_invoke_latency(mut self, latency: Duration) -> Self {
        self.invoke_latency = latency;
        self
    }

    /// Makes state reads fail while `fail` is set.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Every service call accepted so far, oldest first.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock_invocations()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn invocations_for(&self, entity_id: &str) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|call| call.entity_id() == Some(entity_id))
            .collect()
    }

    pub fn clear_invocations(&self) {
        if let Ok(mut calls) = self.lock_invocations() {
            calls.clear();
        }
    }

    fn lock_lights(&self) -> Result<MutexGuard<'_, BTreeMap<String, LightSlot>>> {
        self.lights
            .lock()
            .map_err(|_| LightSyncError::msg("simulated lights have been poisoned"))
    }

    fn lock_invocations(&self) -> Result<MutexGuard<'_, Vec<Invocation>>> {
        self.invocations
            .lock()
            .map_err(|_| LightSyncError::msg("invocation log has been poisoned"))
    }

    fn check_reads(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LightSyncError::upstream("simulated state source is down"));
        }
        Ok(())
    }
}

#[async_trait]
impl HomeHub for SimulatedHub {
    async fn read_state(&self, entity_id: &str) -> Result<EntityState> {
        self.check_reads()?;
        let now = Instant::now();
        let mut lights = self.lock_lights()?;
        match lights.get_mut(entity_id) {
            Some(slot) if slot.light.offline => Err(LightSyncError::upstream(format!(
                "`{entity_id}` is unreachable"
            ))),
            Some(slot) => {
                slot.settle(now);
                Ok(slot.light.state.clone())
            }
            None => self
                .others
                .iter()
                .find(|e| e.entity_id == entity_id)
                .cloned()
                .ok_or_else(|| LightSyncError::upstream(format!("unknown entity `{entity_id}`"))),
        }
    }

    async fn read_states(&self) -> Result<Vec<EntityState>> {
        self.check_reads()?;
        let now = Instant::now();
        let mut lights = self.lock_lights()?;
        let mut states: Vec<EntityState> = lights
            .values_mut()
            .map(|slot| {
                slot.settle(now);
                if slot.light.offline {
                    EntityState {
                        state: "unavailable".to_string(),
                        ..slot.light.state.clone()
                    }
                } else {
                    slot.light.state.clone()
                }
            })
            .collect();
        states.extend(self.others.iter().cloned());
        Ok(states)
    }

    async fn invoke_service(&self, domain: &str, service: &str, payload: Value) -> Result<()> {
        if !self.invoke_latency.is_zero() {
            tokio::time::sleep(self.invoke_latency).await;
        }

        let now = Instant::now();
        self.lock_invocations()?.push(Invocation {
            domain: domain.to_string(),
            service: service.to_string(),
            payload: payload.clone(),
            at: now,
        });

        let entity_id = payload
            .get("entity_id")
            .and_then(Value::as_str)
            .ok_or_else(|| LightSyncError::upstream("service call without entity_id"))?;

        let mut lights = self.lock_lights()?;
        let slot = lights
            .get_mut(entity_id)
            .ok_or_else(|| LightSyncError::upstream(format!("unknown entity `{entity_id}`")))?;

        if slot.light.offline {
            return Err(LightSyncError::upstream(format!(
                "`{entity_id}` is unreachable"
            )));
        }
        if slot.light.unresponsive {
            return Ok(());
        }

        slot.settle(now);
        let transition = payload
            .get("transition")
            .and_then(Value::as_f64)
            .filter(|t| *t > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or_default();
        let (state, attributes) = slot.light.apply_command(service, &payload);
        slot.pending = Some(Pending {
            ready_at: now + slot.light.response_delay + transition,
            state,
            attributes,
        });
        Ok(())
    }
}

impl std::fmt::Debug for SimulatedHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedHub")
            .field("others", &self.others.len())
            .field("invoke_latency", &self.invoke_latency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn state_changes_after_response_delay() {
        let hub = SimulatedHub::new(vec![SimulatedLight::new("light.a", "A")
            .with_response_delay(Duration::from_millis(200))]);

        hub.invoke_service("light", "turn_on", json!({ "entity_id": "light.a", "brightness": 100 }))
            .await
            .unwrap();
        assert!(!hub.read_state("light.a").await.unwrap().is_on());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let state = hub.read_state("light.a").await.unwrap();
        assert!(state.is_on());
        assert_eq!(state.brightness(), Some(100));
        assert_eq!(hub.invocations_for("light.a").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distorts_colour_and_brightness() {
        let hub = SimulatedHub::new(vec![SimulatedLight::new("light.a", "A")
            .with_color_modes(&["hs"])
            .with_color_shift([-20, 0, 30])
            .with_brightness_gamma(2.0)
            .with_response_delay(Duration::ZERO)]);

        hub.invoke_service(
            "light",
            "turn_on",
            json!({ "entity_id": "light.a", "brightness": 128, "rgb_color": [10, 100, 250] }),
        )
        .await
        .unwrap();

        let state = hub.read_state("light.a").await.unwrap();
        assert_eq!(state.rgb_color(), Some([0, 100, 255]));
        assert_eq!(state.brightness(), Some(64));
    }

    #[tokio::test]
    async fn offline_lights_fail_reads() {
        let hub = SimulatedHub::new(vec![SimulatedLight::new("light.a", "A").offline()]);
        assert!(matches!(
            hub.read_state("light.a").await.unwrap_err(),
            LightSyncError::Upstream(_)
        ));
        let states = hub.read_states().await.unwrap();
        assert_eq!(states[0].state, "unavailable");
    }
}
