//! Bridge configuration: defaults, builders and environment overrides.

use std::time::Duration;

use crate::channel::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::liveness::LivenessConfig;

pub const ENV_CALL_TIMEOUT_SECS: &str = "CIRRUS_CALL_TIMEOUT_SECS";
pub const ENV_READY_TIMEOUT_SECS: &str = "CIRRUS_READY_TIMEOUT_SECS";
pub const ENV_PROBE_TIMEOUT_MS: &str = "CIRRUS_PROBE_TIMEOUT_MS";
pub const ENV_PROBE_INTERVAL_MS: &str = "CIRRUS_PROBE_INTERVAL_MS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Per-call deadline; `None` lets calls wait for the worker indefinitely.
    pub call_timeout: Option<Duration>,
    pub ready_timeout: Duration,
    pub liveness: LivenessConfig,
    /// Progress events buffered per subscriber before slow ones lag.
    pub progress_capacity: usize,
    pub max_frame_length: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(600)),
            ready_timeout: Duration::from_secs(30),
            liveness: LivenessConfig::default(),
            progress_capacity: 256,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl BridgeConfig {
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_progress_capacity(mut self, capacity: usize) -> Self {
        self.progress_capacity = capacity.max(1);
        self
    }

    pub fn with_max_frame_length(mut self, length: usize) -> Self {
        self.max_frame_length = length;
        self
    }

    /// Defaults overlaid with `CIRRUS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each `CIRRUS_*`
    /// key. Unset keys keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = parse_u64(&lookup, ENV_CALL_TIMEOUT_SECS)? {
            config.call_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_u64(&lookup, ENV_READY_TIMEOUT_SECS)? {
            config.ready_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64(&lookup, ENV_PROBE_TIMEOUT_MS)? {
            config.liveness.probe_timeout = Duration::from_millis(positive(ENV_PROBE_TIMEOUT_MS, ms)?);
        }
        if let Some(ms) = parse_u64(&lookup, ENV_PROBE_INTERVAL_MS)? {
            config.liveness.interval = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<u64>()
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

fn positive(key: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.call_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.ready_timeout, Duration::from_secs(30));
        assert_eq!(config.liveness, LivenessConfig::default());
        assert_eq!(config.progress_capacity, 256);
        assert_eq!(config.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
    }

    #[test]
    fn empty_environment_keeps_defaults() {
        assert_eq!(
            BridgeConfig::from_lookup(lookup(&[])).unwrap(),
            BridgeConfig::default()
        );
    }

    #[test]
    fn environment_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            (ENV_CALL_TIMEOUT_SECS, "45"),
            (ENV_READY_TIMEOUT_SECS, "3"),
            (ENV_PROBE_TIMEOUT_MS, "750"),
            (ENV_PROBE_INTERVAL_MS, " 2000 "),
        ]))
        .unwrap();

        assert_eq!(config.call_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.ready_timeout, Duration::from_secs(3));
        assert_eq!(config.liveness.probe_timeout, Duration::from_millis(750));
        assert_eq!(config.liveness.interval, Duration::from_secs(2));
    }

    #[test]
    fn zero_call_timeout_disables_deadline() {
        let config = BridgeConfig::from_lookup(lookup(&[(ENV_CALL_TIMEOUT_SECS, "0")])).unwrap();
        assert_eq!(config.call_timeout, None);
    }

    #[test]
    fn blank_value_is_ignored() {
        let config = BridgeConfig::from_lookup(lookup(&[(ENV_READY_TIMEOUT_SECS, "  ")])).unwrap();
        assert_eq!(config.ready_timeout, Duration::from_secs(30));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = BridgeConfig::from_lookup(lookup(&[(ENV_PROBE_INTERVAL_MS, "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: ENV_PROBE_INTERVAL_MS, ref value, .. } if value == "soon"
        ));

        let err = BridgeConfig::from_lookup(lookup(&[(ENV_PROBE_TIMEOUT_MS, "0")])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value \"0\" for CIRRUS_PROBE_TIMEOUT_MS: must be greater than zero"
        );
    }

    #[test]
    fn builders() {
        let config = BridgeConfig::default()
            .with_call_timeout(None)
            .with_ready_timeout(Duration::from_secs(1))
            .with_progress_capacity(0)
            .with_max_frame_length(1024)
            .with_liveness(LivenessConfig::default().with_interval(Duration::from_millis(100)));

        assert_eq!(config.call_timeout, None);
        assert_eq!(config.ready_timeout, Duration::from_secs(1));
        assert_eq!(config.progress_capacity, 1);
        assert_eq!(config.max_frame_length, 1024);
        assert_eq!(config.liveness.interval, Duration::from_millis(100));
    }
}
