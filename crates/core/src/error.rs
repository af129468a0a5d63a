/// Result alias that carries the custom [`LightSyncError`] type.
pub type Result<T> = std::result::Result<T, LightSyncError>;

/// Common error type for the core crate.
///
/// The first four variants form the operational taxonomy: bad input,
/// unsupported device features, devices that do not respond in time and
/// failures of the external home-automation collaborator. The remaining
/// variants wrap errors from the libraries the crate sits on.
#[derive(Debug, thiserror::Error)]
pub enum LightSyncError {
    /// Malformed or oversized audio, invalid timeline documents and other
    /// caller-supplied data that cannot be processed.
    #[error("invalid input: {0}")]
    Input(String),
    /// A command type the target device does not support.
    #[error("device `{entity_id}` does not support {command}")]
    CapabilityMismatch { entity_id: String, command: String },
    /// A device did not respond before the configured timeout elapsed.
    #[error("device `{entity_id}` did not respond within {timeout_ms} ms")]
    DeviceUnresponsive { entity_id: String, timeout_ms: u64 },
    /// Failure reported by the external state-read or service-invoke
    /// interface.
    #[error("upstream error: {0}")]
    Upstream(String),
    /// Catch-all for failures that do not fit the taxonomy above.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Serialisation failure for a timeline, profile or hub payload.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Container or codec error from the audio decoder.
    #[error("audio decoding failed: {0}")]
    Decode(#[from] symphonia::core::errors::Error),
    /// Transport failure talking to the hub or fetching remote audio.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LightSyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Builds a [`LightSyncError::Input`] from a message.
    pub fn input<T: Into<String>>(msg: T) -> Self {
        Self::Input(msg.into())
    }

    /// Builds a [`LightSyncError::Upstream`] from a message.
    pub fn upstream<T: Into<String>>(msg: T) -> Self {
        Self::Upstream(msg.into())
    }

    /// Returns true for failures that only degrade a single sample or
    /// command and should be absorbed rather than surfaced.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CapabilityMismatch { .. } | Self::DeviceUnresponsive { .. }
        )
    }
}

impl From<&str> for LightSyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LightSyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_taxonomy_variants() {
        let err = LightSyncError::DeviceUnresponsive {
            entity_id: "light.desk".to_string(),
            timeout_ms: 3000,
        };
        assert_eq!(
            err.to_string(),
            "device `light.desk` did not respond within 3000 ms"
        );
        assert!(err.is_recoverable());
        assert!(!LightSyncError::upstream("boom").is_recoverable());
    }
}
