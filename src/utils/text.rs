pub fn truncate_utf8_prefix(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// First line of a command, shortened for status lines.
pub fn summarize_command(command: &str, max_bytes: usize) -> String {
    let first = command.trim().lines().next().unwrap_or("");
    let multi_line = command.trim().lines().nth(1).is_some();
    let short = truncate_utf8_prefix(first, max_bytes);
    if multi_line || short.len() < first.len() {
        format!("{}...", short)
    } else {
        short
    }
}
