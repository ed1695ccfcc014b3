use thiserror::Error;

/// Why an SSH transport could not be established.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionFailure {
    #[error("SSH host {host}:{port} is unreachable: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("SSH handshake with {host} timed out after {timeout_ms}ms")]
    HandshakeTimeout { host: String, timeout_ms: u64 },
    #[error("SSH handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },
    #[error("SSH host key mismatch for {host} (expected {expected}, got {observed})")]
    HostKeyMismatch {
        host: String,
        expected: String,
        observed: String,
    },
    #[error("SSH host key for {host} is not trusted ({observed})")]
    HostKeyUnknown { host: String, observed: String },
    #[error("SSH authentication failed for {username}@{host}")]
    Authentication { username: String, host: String },
}

impl ConnectionFailure {
    pub fn code(&self) -> &'static str {
        match self {
            ConnectionFailure::Unreachable { .. } => "HOST_UNREACHABLE",
            ConnectionFailure::HandshakeTimeout { .. } => "HANDSHAKE_TIMEOUT",
            ConnectionFailure::Handshake { .. } => "HANDSHAKE_FAILED",
            ConnectionFailure::HostKeyMismatch { .. } => "HOST_KEY_MISMATCH",
            ConnectionFailure::HostKeyUnknown { .. } => "HOST_KEY_UNKNOWN",
            ConnectionFailure::Authentication { .. } => "AUTH_FAILED",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ConnectionFailure::HostKeyUnknown { .. } => Some(
                "Add the host to known_hosts, pin host_key_fingerprint, or set allow_any_hosts=true.",
            ),
            ConnectionFailure::HostKeyMismatch { .. } => {
                Some("The remote host key changed. Verify the host before updating known_hosts.")
            }
            ConnectionFailure::Authentication { .. } => {
                Some("Check the credential bound to credential_id.")
            }
            _ => None,
        }
    }
}
