//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for an [`Engine`](crate::engine::Engine).
///
/// Deserializable so hosts can load it from whatever format they already
/// use for settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Logical namespace this engine writes for. Forwarded to the ordering
    /// adapter with every batch.
    pub namespace: String,
    /// How many completed ticks of receipts to keep.
    pub receipt_history_size: usize,
    /// When set, the game loop ticks on its own at this interval in addition
    /// to explicit tick requests.
    #[serde(with = "millis", rename = "tick_interval_ms")]
    pub tick_interval: Option<Duration>,
    /// Forward each tick's batch to the ordering adapter.
    pub submit_to_adapter: bool,
}

impl Default for EngineConfig {
    /// Namespace `"world"`, ten ticks of receipts, no self-trigger,
    /// submission on.
    fn default() -> Self {
        Self {
            namespace: "world".to_owned(),
            receipt_history_size: 10,
            tick_interval: None,
            submit_to_adapter: true,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.namespace, "world");
        assert_eq!(config.receipt_history_size, 10);
        assert_eq!(config.tick_interval, None);
        assert!(config.submit_to_adapter);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"namespace": "arena", "tick_interval_ms": 50}"#).unwrap();
        assert_eq!(config.namespace, "arena");
        assert_eq!(config.tick_interval, Some(Duration::from_millis(50)));
        assert_eq!(config.receipt_history_size, 10);
        assert!(config.submit_to_adapter);
    }
}
