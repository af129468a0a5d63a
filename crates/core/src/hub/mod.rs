//! Narrow interface onto the home-automation platform: read entity state and
//! invoke services. Everything that talks to real devices goes through
//! [`HomeHub`].

mod http;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

pub use http::HttpHub;
pub use simulated::{Invocation, SimulatedHub, SimulatedLight};

/// Snapshot of one entity as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl EntityState {
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    /// Domain part of the entity id (`light` for `light.kitchen`).
    pub fn domain(&self) -> &str {
        self.entity_id
            .split_once('.')
            .map(|(domain, _)| domain)
            .unwrap_or("")
    }

    pub fn is_on(&self) -> bool {
        self.state == "on"
    }

    pub fn is_available(&self) -> bool {
        !matches!(self.state.as_str(), "unavailable" | "unknown")
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn attr_u64(&self, key: &str) -> Option<u64> {
        self.attributes.get(key).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
        })
    }

    /// Reported brightness, or 0 while the light is off.
    pub fn brightness(&self) -> Option<u8> {
        if !self.is_on() {
            return Some(0);
        }
        self.attr_u64("brightness").map(|b| b.min(255) as u8)
    }

    pub fn rgb_color(&self) -> Option<[u8; 3]> {
        let values = self.attributes.get("rgb_color")?.as_array()?;
        if values.len() != 3 {
            return None;
        }
        let mut rgb = [0u8; 3];
        for (slot, value) in rgb.iter_mut().zip(values) {
            *slot = value.as_u64()?.min(255) as u8;
        }
        Some(rgb)
    }

    /// String entries of a list attribute; empty when absent.
    pub fn string_list(&self, key: &str) -> Vec<String> {
        self.attributes
            .get(key)
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The two operations the engine needs from the outside world. Calls are
/// fallible and may be slow; callers wrap them in their own timeouts.
#[async_trait]
pub trait HomeHub: Send + Sync {
    async fn read_state(&self, entity_id: &str) -> Result<EntityState>;

    async fn read_states(&self) -> Result<Vec<EntityState>>;

    async fn invoke_service(&self, domain: &str, service: &str, payload: Value) -> Result<()>;
}
