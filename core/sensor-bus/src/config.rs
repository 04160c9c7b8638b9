//! Bus configuration

use crate::error::{BusError, BusResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default mailbox depth at which a backlog warning is logged
pub const DEFAULT_MAILBOX_WARN_DEPTH: usize = 10_000;

/// Settings for one [`MessageBus`](crate::MessageBus) instance.
///
/// Every field has a default, so `{}` is a valid configuration.
///
/// ```
/// use sensor_bus::BusConfig;
///
/// let config = BusConfig::from_json_str(r#"{ "name": "gurion", "mailbox_warn_depth": 64 }"#).unwrap();
/// assert_eq!(config.name, "gurion");
/// assert_eq!(config.mailbox_warn_depth, Some(64));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Name attached to the bus in log output
    pub name: String,

    /// Log a warning each time a mailbox backlog reaches a multiple of this
    /// depth. Purely diagnostic: sends are never refused. `None` disables it.
    pub mailbox_warn_depth: Option<usize>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: "bus".to_string(),
            mailbox_warn_depth: Some(DEFAULT_MAILBOX_WARN_DEPTH),
        }
    }
}

impl BusConfig {
    /// Parse a configuration from JSON text
    pub fn from_json_str(json: &str) -> BusResult<Self> {
        serde_json::from_str(json).map_err(|e| BusError::Config(e.to_string()))
    }

    /// Read and parse a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> BusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BusError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub(crate) fn backlog_warning_due(&self, depth: usize) -> bool {
        match self.mailbox_warn_depth {
            Some(limit) if limit > 0 => depth % limit == 0,
            _ => false,
        }
    }
}
