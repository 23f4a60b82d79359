//! Multiplexer configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Tunables for one multiplexing session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Capacity of the queue of remotely opened streams awaiting `accept`
    pub accept_backlog: usize,

    /// How long a session may sit with no streams before it closes itself
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Records buffered per physical connection before senders wait
    pub connection_send_buffer: usize,

    /// Largest payload placed in a single frame
    pub max_frame_payload: usize,

    /// Throughput limits for the valve shared by a user's sessions
    ///
    /// Read only by `Valve::from_config`; a session uses whatever valve it
    /// is handed and does not look at this field.
    pub valve: ValveConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            accept_backlog: 1024,
            idle_timeout: Duration::from_secs(30),
            connection_send_buffer: 256,
            max_frame_payload: shroud_protocol::MAX_PAYLOAD_SIZE,
            valve: ValveConfig::default(),
        }
    }
}

impl MuxConfig {
    /// Reject values the multiplexer cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accept_backlog == 0 {
            return Err(ConfigError::Invalid(
                "accept_backlog must be at least 1".to_string(),
            ));
        }
        if self.connection_send_buffer == 0 {
            return Err(ConfigError::Invalid(
                "connection_send_buffer must be at least 1".to_string(),
            ));
        }
        if self.max_frame_payload == 0 || self.max_frame_payload > shroud_protocol::MAX_PAYLOAD_SIZE
        {
            return Err(ConfigError::Invalid(format!(
                "max_frame_payload must be between 1 and {}",
                shroud_protocol::MAX_PAYLOAD_SIZE
            )));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "idle_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-user throughput limits, in bytes per second
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValveConfig {
    /// Inbound limit (None = unlimited)
    pub rx_rate: Option<u64>,

    /// Outbound limit (None = unlimited)
    pub tx_rate: Option<u64>,
}

// Durations are stored as whole seconds
mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = MuxConfig::default();
        assert_eq!(config.accept_backlog, 1024);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.max_frame_payload, shroud_protocol::MAX_PAYLOAD_SIZE);
        assert!(config.valve.rx_rate.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: MuxConfig = toml::from_str(
            r#"
            idle_timeout = 5

            [valve]
            tx_rate = 1048576
            "#,
        )
        .unwrap();

        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.accept_backlog, 1024);
        assert_eq!(config.valve.tx_rate, Some(1_048_576));
        assert_eq!(config.valve.rx_rate, None);
    }

    #[test]
    fn test_validate_rejects_zero_backlog() {
        let config = MuxConfig {
            accept_backlog: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_oversized_frames() {
        let config = MuxConfig {
            max_frame_payload: shroud_protocol::MAX_PAYLOAD_SIZE + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
