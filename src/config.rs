use crate::constants::{env_keys, limits, network};
use std::time::Duration;

/// Engine-wide knobs. Compiled defaults, overridable through `SSHSTEPS_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub connect_timeout_ms: u64,
    pub exec_default_timeout_ms: Option<u64>,
    pub max_capture_bytes: usize,
    pub poll_interval_ms: u64,
    pub reuse_sessions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: network::TIMEOUT_SSH_READY_MS,
            exec_default_timeout_ms: None,
            max_capture_bytes: limits::MAX_CAPTURE_BYTES,
            poll_interval_ms: network::EXEC_POLL_INTERVAL_MS,
            reuse_sessions: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            connect_timeout_ms: read_env_u64(env_keys::CONNECT_TIMEOUT_MS)
                .unwrap_or(defaults.connect_timeout_ms),
            exec_default_timeout_ms: read_env_u64(env_keys::EXEC_TIMEOUT_MS)
                .or(defaults.exec_default_timeout_ms),
            max_capture_bytes: read_env_u64(env_keys::MAX_CAPTURE_BYTES)
                .map(|v| v as usize)
                .unwrap_or(defaults.max_capture_bytes),
            poll_interval_ms: read_env_u64(env_keys::POLL_INTERVAL_MS)
                .unwrap_or(defaults.poll_interval_ms),
            reuse_sessions: read_env_bool(env_keys::REUSE_SESSIONS).unwrap_or(false),
        }
    }

    pub fn exec_default_timeout(&self) -> Option<Duration> {
        self.exec_default_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn read_env_u64(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

fn read_env_bool(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
