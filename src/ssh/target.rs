use crate::constants::network;
use crate::errors::StepError;
use crate::services::validation::Validation;
use crate::utils::paths::expand_home_path;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// A connection endpoint, fixed for the lifetime of a step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
    #[serde(default)]
    pub allow_any_hosts: bool,
    pub connect_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
}

impl RemoteTarget {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        credential_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: network::SSH_DEFAULT_PORT,
            username: username.into(),
            credential_id: credential_id.into(),
            known_hosts: None,
            host_key_fingerprint: None,
            allow_any_hosts: false,
            connect_timeout_ms: network::TIMEOUT_SSH_READY_MS,
            keepalive_interval_ms: network::KEEPALIVE_INTERVAL_MS,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn allowing_any_hosts(mut self) -> Self {
        self.allow_any_hosts = true;
        self
    }

    /// Parses a remote definition from job configuration.
    ///
    /// Accepts `user` or `username`, and `credential_id` or `credentials_id`.
    pub fn from_value(validation: &Validation, value: &Value) -> Result<Self, StepError> {
        if !value.is_object() {
            return Err(StepError::missing("remote"));
        }
        let host = validation.ensure_string(value.get("host"), "host")?;
        let name = validation
            .ensure_optional_string(value.get("name"), "name")?
            .unwrap_or_else(|| host.clone());
        let username = validation.ensure_string(
            value.get("user").or_else(|| value.get("username")),
            "user",
        )?;
        let credential_id = validation.ensure_string(
            value
                .get("credential_id")
                .or_else(|| value.get("credentials_id")),
            "credential_id",
        )?;
        let port = validation.ensure_port(value.get("port"), network::SSH_DEFAULT_PORT)?;
        let known_hosts = validation
            .ensure_optional_string(value.get("known_hosts"), "known_hosts")?
            .map(expand_home_path);
        let host_key_fingerprint = normalize_fingerprint_sha256(
            validation
                .ensure_optional_string(
                    value.get("host_key_fingerprint"),
                    "host_key_fingerprint",
                )?
                .as_deref(),
        );
        let allow_any_hosts = value
            .get("allow_any_hosts")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let connect_timeout_ms = read_positive_int(value.get("connect_timeout_ms"))
            .unwrap_or(network::TIMEOUT_SSH_READY_MS);
        let keepalive_interval_ms = read_positive_int(value.get("keepalive_interval_ms"))
            .unwrap_or(network::KEEPALIVE_INTERVAL_MS);

        Ok(Self {
            name,
            host,
            port,
            username,
            credential_id,
            known_hosts,
            host_key_fingerprint,
            allow_any_hosts,
            connect_timeout_ms,
            keepalive_interval_ms,
        })
    }

    /// Re-checks a target built in code, with the same rules `from_value` applies.
    pub fn validate(&self, validation: &Validation) -> Result<(), StepError> {
        validation.ensure_present(Some(&self.host), "host")?;
        validation.ensure_present(Some(&self.username), "user")?;
        validation.ensure_present(Some(&self.credential_id), "credential_id")?;
        if self.port == 0 {
            return Err(StepError::validation(
                "port must be an integer between 1 and 65535",
            ));
        }
        Ok(())
    }

    pub fn strict_host_key_checking(&self) -> bool {
        !self.allow_any_hosts
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn display_name(&self) -> String {
        format!("{}[{}@{}]", self.name, self.username, self.address())
    }
}

pub fn read_positive_int(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    let numeric = value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<u64>().ok()))?;
    (numeric > 0).then_some(numeric)
}

pub(crate) fn normalize_fingerprint_sha256(value: Option<&str>) -> Option<String> {
    let trimmed = value.unwrap_or("").trim();
    if trimmed.is_empty() {
        return None;
    }
    let cleaned = trimmed.trim_end_matches('=');
    match cleaned.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => {
            Some(format!("SHA256:{}", cleaned[7..].trim()))
        }
        _ => Some(format!("SHA256:{}", cleaned)),
    }
}
