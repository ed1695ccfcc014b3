/// Single-quotes a value for POSIX `sh`.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

pub fn in_directory(dir: Option<&str>, command: &str) -> String {
    match dir.map(str::trim).filter(|d| !d.is_empty()) {
        Some(dir) => format!("cd {} && {}", quote(dir), command),
        None => command.to_string(),
    }
}

/// Runs `command` under `sudo`, reading the password from stdin without a prompt.
pub fn with_sudo(command: &str) -> String {
    format!("sudo -S -p '' sh -c {}", quote(command))
}
