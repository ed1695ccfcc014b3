use serde::Serialize;
use std::io::Write;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Engine status lines: what is about to run, exit status, session timing.
    Status,
}

/// The job log: an append-only stream of lines owned by the host.
pub trait LogSink: Send + Sync {
    fn line(&self, stream: StreamKind, line: &str);
}

/// Writes remote stdout to the process stdout and everything else to stderr.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn line(&self, stream: StreamKind, line: &str) {
        match stream {
            StreamKind::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{}", line);
            }
            StreamKind::Stderr => {
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "{}", line);
            }
            StreamKind::Status => {
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "[sshsteps] {}", line);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(StreamKind, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(StreamKind, String)> {
        self.lines
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn stream(&self, stream: StreamKind) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(kind, _)| *kind == stream)
            .map(|(_, line)| line)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn line(&self, stream: StreamKind, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push((stream, line.to_string()));
    }
}
