use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    hub::{EntityState, HomeHub},
    Result,
};

const COLOR_MODES: [&str; 5] = ["hs", "rgb", "rgbw", "rgbww", "xy"];

// Legacy `supported_features` bits for lights without colour-mode metadata.
const LEGACY_BRIGHTNESS: u64 = 1;
const LEGACY_COLOR_TEMP: u64 = 2;
const LEGACY_EFFECT: u64 = 4;
const LEGACY_COLOR: u64 = 16;

/// A single controllable feature of a light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Color,
    ColorTemp,
    Brightness,
    Effects,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Capability::Color => "color",
            Capability::ColorTemp => "color_temp",
            Capability::Brightness => "brightness",
            Capability::Effects => "effects",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for Capability {
    type Err = crate::LightSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "color" => Ok(Capability::Color),
            "color_temp" => Ok(Capability::ColorTemp),
            "brightness" => Ok(Capability::Brightness),
            "effects" => Ok(Capability::Effects),
            other => Err(crate::LightSyncError::input(format!(
                "unknown capability `{other}`"
            ))),
        }
    }
}

/// Capabilities resolved once at scan time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySet {
    pub supports_color: bool,
    pub supports_color_temp: bool,
    pub supports_brightness: bool,
    pub supported_effects: Vec<String>,
}

impl CapabilitySet {
    pub fn from_state(state: &EntityState) -> Self {
        let modes = state.string_list("supported_color_modes");
        let supported_effects = state.string_list("effect_list");

        if modes.is_empty() {
            let bits = state.attr_u64("supported_features").unwrap_or(0);
            return Self {
                supports_color: bits & LEGACY_COLOR != 0,
                supports_color_temp: bits & LEGACY_COLOR_TEMP != 0,
                supports_brightness: bits & (LEGACY_BRIGHTNESS | LEGACY_COLOR | LEGACY_COLOR_TEMP)
                    != 0,
                supported_effects: if bits & LEGACY_EFFECT != 0 {
                    supported_effects
                } else {
                    Vec::new()
                },
            };
        }

        let supports_color = modes.iter().any(|m| COLOR_MODES.contains(&m.as_str()));
        let supports_color_temp = modes.iter().any(|m| m == "color_temp");
        let supports_brightness =
            supports_color || supports_color_temp || modes.iter().any(|m| m == "brightness");

        Self {
            supports_color,
            supports_color_temp,
            supports_brightness,
            supported_effects,
        }
    }

    /// True when the light advertises `capability`.
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Color => self.supports_color,
            Capability::ColorTemp => self.supports_color_temp,
            Capability::Brightness => self.supports_brightness,
            Capability::Effects => !self.supported_effects.is_empty(),
        }
    }

    pub fn supports_effect(&self, effect: &str) -> bool {
        self.supported_effects.iter().any(|e| e == effect)
    }
}

/// A controllable light discovered on the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightDevice {
    pub entity_id: String,
    pub name: String,
    pub area: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub capabilities: CapabilitySet,
}

impl LightDevice {
    pub fn from_state(state: &EntityState) -> Self {
        Self {
            entity_id: state.entity_id.clone(),
            name: state
                .attr_str("friendly_name")
                .unwrap_or(&state.entity_id)
                .to_string(),
            area: state
                .attr_str("area_id")
                .or_else(|| state.attr_str("area"))
                .map(str::to_string),
            manufacturer: state.attr_str("manufacturer").map(str::to_string),
            model: state.attr_str("model").map(str::to_string),
            capabilities: CapabilitySet::from_state(state),
        }
    }
}

/// Optional narrowing of a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub capability: Option<Capability>,
    pub area: Option<String>,
}

impl ScanFilter {
    /// Keep only lights with `capability`.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    /// Keep only lights assigned to `area`.
    pub fn in_area(mut self, area: impl Into<String>) -> Self {
        self.area = Some(area.into());
        self
    }

    fn matches(&self, device: &LightDevice) -> bool {
        let capability_ok = self
            .capability
            .map(|c| device.capabilities.has(c))
            .unwrap_or(true);
        let area_ok = match &self.area {
            Some(area) => device
                .area
                .as_deref()
                .is_some_and(|a| a.eq_ignore_ascii_case(area)),
            None => true,
        };
        capability_ok && area_ok
    }
}

/// Enumerates controllable lights through the state-read interface.
#[derive(Clone)]
pub struct DeviceScanner {
    hub: Arc<dyn HomeHub>,
}

impl DeviceScanner {
    pub fn new(hub: Arc<dyn HomeHub>) -> Self {
        Self { hub }
    }

    /// Lists available lights sorted by entity id. Read failures propagate;
    /// finding nothing is not an error.
    pub async fn scan(&self, filter: &ScanFilter) -> Result<Vec<LightDevice>> {
        let states = self.hub.read_states().await?;
        let total = states.len();

        let mut devices: Vec<LightDevice> = states
            .iter()
            .filter(|state| state.domain() == "light" && state.is_available())
            .map(LightDevice::from_state)
            .filter(|device| filter.matches(device))
            .collect();
        devices.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

        tracing::info!(
            entities = total,
            lights = devices.len(),
            ?filter,
            "device scan complete"
        );
        Ok(devices)
    }
}

impl fmt::Debug for DeviceScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceScanner").finish()
    }
}
