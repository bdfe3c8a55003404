use std::env;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Per-connection tuning shared by both roles.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bound for each of the three waits in the closing handshake.
    #[serde(deserialize_with = "seconds")]
    pub close_timeout: Duration,
    /// Ceiling for one message, summed across its fragments.
    pub max_frame_payload: usize,
    /// Inbound queue capacity. `None` is unbounded; a full queue drops its oldest message.
    pub max_queue: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(10),
            max_frame_payload: 1 << 26,
            max_queue: None,
        }
    }
}

fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

impl Config {
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_max_frame_payload(mut self, max: usize) -> Self {
        self.max_frame_payload = max;
        self
    }

    pub fn with_max_queue(mut self, max: Option<usize>) -> Self {
        self.max_queue = max;
        self
    }

    /// Loads `.env` (if any) and overrides the defaults from
    /// `WS_CLOSE_TIMEOUT`, `WS_MAX_FRAME_PAYLOAD` and `WS_MAX_QUEUE`.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::default();

        if let Ok(value) = env::var("WS_CLOSE_TIMEOUT") {
            let secs: f64 = parse_var("WS_CLOSE_TIMEOUT", &value)?;
            config.close_timeout = Duration::try_from_secs_f64(secs)
                .map_err(|e| Error::Config(format!("WS_CLOSE_TIMEOUT: {e}")))?;
        }
        if let Ok(value) = env::var("WS_MAX_FRAME_PAYLOAD") {
            config.max_frame_payload = parse_var("WS_MAX_FRAME_PAYLOAD", &value)?;
        }
        if let Ok(value) = env::var("WS_MAX_QUEUE") {
            config.max_queue = match value.trim() {
                "" | "none" => None,
                other => Some(parse_var("WS_MAX_QUEUE", other)?),
            };
        }
        Ok(config)
    }

    /// Parses a JSON document such as `{"close_timeout": 2.5, "max_queue": 64}`.
    /// simd-json parses in place, hence the owned buffer.
    pub fn from_json(mut data: Vec<u8>) -> Result<Self> {
        simd_json::serde::from_slice(&mut data).map_err(|e| Error::Config(e.to_string()))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.close_timeout, Duration::from_secs(10));
        assert_eq!(config.max_frame_payload, 64 * 1024 * 1024);
        assert_eq!(config.max_queue, None);
    }

    #[test]
    fn test_from_json_partial() {
        let config = Config::from_json(br#"{"close_timeout": 2.5, "max_queue": 16}"#.to_vec()).unwrap();
        assert_eq!(config.close_timeout, Duration::from_millis(2500));
        assert_eq!(config.max_queue, Some(16));
        assert_eq!(config.max_frame_payload, 1 << 26);
    }

    #[test]
    fn test_from_json_rejects_negative_timeout() {
        let err = Config::from_json(br#"{"close_timeout": -1.0}"#.to_vec()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
