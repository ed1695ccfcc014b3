use crate::constants::env_keys;
use crate::errors::StepError;
use crate::utils::paths::expand_home_path;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Authentication material, resolved at session-creation time and never stored.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

impl Credential {
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PrivateKey { .. } => "private_key",
            Credential::KeyFile { .. } => "key_file",
            Credential::Agent => "agent",
        }
    }

    /// The secret sudo reads on stdin, if this credential carries one.
    pub fn sudo_password(&self) -> Option<&str> {
        match self {
            Credential::Password(password) => Some(password.as_str()),
            _ => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::KeyFile { path, .. } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &"<redacted>")
                .finish(),
            other => write!(f, "Credential({}, <redacted>)", other.method()),
        }
    }
}

pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, credential_id: &str) -> Result<Credential, StepError>;
}

#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    entries: HashMap<String, Credential>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, credential_id: impl Into<String>, credential: Credential) -> Self {
        self.entries.insert(credential_id.into(), credential);
        self
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, credential_id: &str) -> Result<Credential, StepError> {
        self.entries
            .get(credential_id)
            .cloned()
            .ok_or_else(|| unknown_credential(credential_id))
    }
}

/// Looks credentials up in `<PREFIX>_<ID>_{PASSWORD,KEY,KEY_FILE,PASSPHRASE,AGENT}`.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    prefix: String,
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new(env_keys::CREDENTIAL_PREFIX)
    }
}

impl EnvCredentials {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('_').to_string(),
        }
    }

    fn var_name(&self, credential_id: &str, suffix: &str) -> String {
        let normalized: String = credential_id
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}_{}", self.prefix, normalized, suffix)
    }

    fn read(&self, credential_id: &str, suffix: &str) -> Option<String> {
        std::env::var(self.var_name(credential_id, suffix))
            .ok()
            .filter(|v| !v.is_empty())
    }
}

impl CredentialResolver for EnvCredentials {
    fn resolve(&self, credential_id: &str) -> Result<Credential, StepError> {
        let passphrase = self.read(credential_id, "PASSPHRASE");
        if let Some(key) = self.read(credential_id, "KEY") {
            return Ok(Credential::PrivateKey { key, passphrase });
        }
        if let Some(path) = self.read(credential_id, "KEY_FILE") {
            return Ok(Credential::KeyFile {
                path: expand_home_path(path),
                passphrase,
            });
        }
        if let Some(password) = self.read(credential_id, "PASSWORD") {
            return Ok(Credential::Password(password));
        }
        if self.read(credential_id, "AGENT").is_some() {
            return Ok(Credential::Agent);
        }
        Err(unknown_credential(credential_id).with_hint(format!(
            "Set {} (or _KEY, _KEY_FILE, _AGENT).",
            self.var_name(credential_id, "PASSWORD")
        )))
    }
}

fn unknown_credential(credential_id: &str) -> StepError {
    StepError::validation(format!("credential not found: {}", credential_id))
}
