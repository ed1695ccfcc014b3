pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const TIMEOUT_SSH_READY_MS: u64 = 10_000;
    pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;
    pub const TIMEOUT_SSH_EXEC_HARD_GRACE_MS: u64 = 2_000;
    pub const EXEC_POLL_INTERVAL_MS: u64 = 20;
}

pub mod limits {
    pub const MAX_PORT: u16 = 65_535;
    pub const MIN_PORT: u16 = 1;
    pub const MAX_CAPTURE_BYTES: usize = 256 * 1024;
    pub const READ_CHUNK_BYTES: usize = 8 * 1024;
    pub const COMMAND_SUBSTRING_LENGTH: usize = 80;
}

pub mod env_keys {
    pub const LOG_LEVEL: &str = "SSHSTEPS_LOG_LEVEL";
    pub const CONNECT_TIMEOUT_MS: &str = "SSHSTEPS_CONNECT_TIMEOUT_MS";
    pub const EXEC_TIMEOUT_MS: &str = "SSHSTEPS_EXEC_TIMEOUT_MS";
    pub const MAX_CAPTURE_BYTES: &str = "SSHSTEPS_MAX_CAPTURE_BYTES";
    pub const POLL_INTERVAL_MS: &str = "SSHSTEPS_POLL_INTERVAL_MS";
    pub const REUSE_SESSIONS: &str = "SSHSTEPS_REUSE_SESSIONS";
    pub const CREDENTIAL_PREFIX: &str = "SSHSTEPS_CREDENTIAL";
}
