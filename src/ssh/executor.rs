use super::channel::{ChannelExit, ExecChannel};
use super::session::TransportSession;
use crate::config::EngineConfig;
use crate::constants::{limits, network};
use crate::errors::StepError;
use crate::services::log_sink::{LogSink, StreamKind};
use crate::services::logger::Logger;
use crate::utils::shell::{in_directory, quote, with_sudo};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ExecutionPayload {
    Command(String),
    ScriptFile(String),
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Sudo {
    password: Option<String>,
}

impl Sudo {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }
}

impl fmt::Debug for Sudo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sudo")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub payload: ExecutionPayload,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub sudo: Option<Sudo>,
    pub pty: bool,
}

impl ExecutionRequest {
    /// Builds a request from exactly one of command text or a remote file path.
    pub fn new(command: Option<&str>, script_file: Option<&str>) -> Result<Self, StepError> {
        fn present(value: Option<&str>) -> Option<&str> {
            value.filter(|v| !v.trim().is_empty())
        }
        match (present(command), present(script_file)) {
            (Some(command), None) => Ok(Self::command(command)),
            (None, Some(path)) => Ok(Self::script_file(path)),
            (Some(_), Some(_)) => Err(StepError::validation(
                "command and script file are mutually exclusive",
            )),
            (None, None) => Err(StepError::missing("command")),
        }
    }

    pub fn command(text: impl Into<String>) -> Self {
        Self::from_payload(ExecutionPayload::Command(text.into()))
    }

    pub fn script_file(path: impl Into<String>) -> Self {
        Self::from_payload(ExecutionPayload::ScriptFile(path.into()))
    }

    fn from_payload(payload: ExecutionPayload) -> Self {
        Self {
            payload,
            working_dir: None,
            env: BTreeMap::new(),
            timeout: None,
            sudo: None,
            pty: false,
        }
    }

    pub fn in_dir(mut self, dir: Option<String>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sudo(mut self, sudo: Option<Sudo>) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn with_pty(mut self, pty: bool) -> Self {
        self.pty = pty;
        self
    }

    /// The exact command line sent to the remote shell.
    ///
    /// A relative script path was already joined onto the working directory,
    /// so only absolute script paths get a `cd` in front.
    pub fn remote_command(&self) -> String {
        let dir = self.working_dir.as_deref();
        let base = match &self.payload {
            ExecutionPayload::Command(text) => in_directory(dir, text),
            ExecutionPayload::ScriptFile(path) => {
                let run = format!("sh -- {}", quote(path));
                if path.starts_with('/') {
                    in_directory(dir, &run)
                } else {
                    run
                }
            }
        };
        match self.sudo {
            Some(_) => with_sudo(&base),
            None => base,
        }
    }

    pub fn describe(&self) -> &str {
        match &self.payload {
            ExecutionPayload::Command(text) => text,
            ExecutionPayload::ScriptFile(path) => path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub text: String,
    pub total_bytes: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// The remote side never acknowledged the forced close.
    pub hard_timed_out: bool,
    pub signal: Option<String>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub duration_ms: u64,
}

/// Where a running command reports to, and how it learns it was cancelled.
#[derive(Clone)]
pub struct ExecutionIo {
    pub log: Arc<dyn LogSink>,
    pub prefix: Option<String>,
    pub cancel: CancellationToken,
}

impl ExecutionIo {
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self {
            log,
            prefix: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: Option<String>) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn status(&self, line: &str) {
        self.log.line(StreamKind::Status, line);
    }
}

pub trait CommandExecutor: Send + Sync {
    fn execute(
        &self,
        session: &mut dyn TransportSession,
        request: &ExecutionRequest,
        io: &ExecutionIo,
    ) -> Result<ExecutionResult, StepError>;
}

/// Runs each request on its own channel, pumping both streams from one polling loop.
#[derive(Debug, Clone)]
pub struct ChannelExecutor {
    logger: Logger,
    max_capture: usize,
    poll_interval: Duration,
    close_grace: Duration,
}

impl ChannelExecutor {
    pub fn new(logger: Logger, config: &EngineConfig) -> Self {
        Self {
            logger: logger.child("exec"),
            max_capture: config.max_capture_bytes,
            poll_interval: config.poll_interval(),
            close_grace: Duration::from_millis(network::TIMEOUT_SSH_EXEC_HARD_GRACE_MS),
        }
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    fn drive(
        &self,
        channel: &mut dyn ExecChannel,
        request: &ExecutionRequest,
        io: &ExecutionIo,
    ) -> Result<ExecutionResult, StepError> {
        let command = request.remote_command();
        channel.exec(&command, &request.env, request.pty)?;

        let mut stdin = request
            .sudo
            .as_ref()
            .and_then(|sudo| sudo.password.as_ref())
            .map(|password| format!("{}\n", password).into_bytes());
        if stdin.is_none() {
            let _ = channel.send_eof();
        }
        let mut stdin_offset = 0usize;

        let mut stdout = LineStream::new(StreamKind::Stdout, self.max_capture);
        let mut stderr = LineStream::new(StreamKind::Stderr, self.max_capture);
        let mut buf = vec![0u8; limits::READ_CHUNK_BYTES];
        let started = Instant::now();
        let mut timed_out = false;

        loop {
            let mut progressed = false;
            if let Some(bytes) = stdin.as_ref() {
                match channel.write_stdin(&bytes[stdin_offset..]) {
                    Ok(n) if n > 0 => {
                        stdin_offset += n;
                        progressed = true;
                    }
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    // The remote stopped reading stdin; nothing left to deliver.
                    Err(_) => stdin_offset = bytes.len(),
                }
                if stdin_offset >= bytes.len() {
                    let _ = channel.send_eof();
                    stdin = None;
                }
            }
            progressed |= pump(channel, &mut stdout, &mut buf, io)?;
            progressed |= pump(channel, &mut stderr, &mut buf, io)?;

            if channel.eof() {
                while pump(channel, &mut stdout, &mut buf, io)?
                    | pump(channel, &mut stderr, &mut buf, io)?
                {}
                break;
            }
            if io.cancel.is_cancelled() {
                channel.close();
                stdout.flush(io);
                stderr.flush(io);
                return Err(StepError::cancelled(format!(
                    "Execution cancelled after {}ms",
                    started.elapsed().as_millis()
                )));
            }
            if let Some(timeout) = request.timeout {
                if started.elapsed() >= timeout {
                    timed_out = true;
                    break;
                }
            }
            if !progressed {
                std::thread::sleep(self.poll_interval);
            }
        }

        let mut hard_timed_out = false;
        let exit = if timed_out {
            hard_timed_out = !channel.close_within(self.close_grace);
            ChannelExit::default()
        } else {
            channel.finish()
        };
        stdout.flush(io);
        stderr.flush(io);

        let result = ExecutionResult {
            exit_code: exit.exit_code,
            timed_out,
            hard_timed_out,
            signal: exit.signal,
            stdout: stdout.into_output(),
            stderr: stderr.into_output(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.logger.debug(
            "execution finished",
            Some(&serde_json::json!({
                "exit_code": result.exit_code,
                "timed_out": result.timed_out,
                "duration_ms": result.duration_ms,
            })),
        );
        Ok(result)
    }
}

impl CommandExecutor for ChannelExecutor {
    fn execute(
        &self,
        session: &mut dyn TransportSession,
        request: &ExecutionRequest,
        io: &ExecutionIo,
    ) -> Result<ExecutionResult, StepError> {
        if io.cancel.is_cancelled() {
            return Err(StepError::cancelled("Execution cancelled before start"));
        }
        let mut channel = session.open_channel()?;
        let outcome = self.drive(channel.as_mut(), request, io);
        if outcome.is_err() {
            channel.close();
        }
        outcome
    }
}

fn pump(
    channel: &mut dyn ExecChannel,
    stream: &mut LineStream,
    buf: &mut [u8],
    io: &ExecutionIo,
) -> Result<bool, StepError> {
    let read = match stream.kind {
        StreamKind::Stderr => channel.read_stderr(buf),
        _ => channel.read_stdout(buf),
    };
    match read {
        Ok(n) if n > 0 => {
            stream.push(&buf[..n], io);
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(StepError::internal(format!(
            "SSH {:?} read failed: {}",
            stream.kind, err
        ))),
    }
}

/// Splits one remote stream into log lines while keeping a bounded copy.
struct LineStream {
    kind: StreamKind,
    pending: Vec<u8>,
    captured: Vec<u8>,
    total: u64,
    truncated: bool,
    max_capture: usize,
}

impl LineStream {
    fn new(kind: StreamKind, max_capture: usize) -> Self {
        Self {
            kind,
            pending: Vec::new(),
            captured: Vec::new(),
            total: 0,
            truncated: false,
            max_capture,
        }
    }

    fn push(&mut self, chunk: &[u8], io: &ExecutionIo) {
        self.total += chunk.len() as u64;
        let room = self.max_capture.saturating_sub(self.captured.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.captured
            .extend_from_slice(&chunk[..chunk.len().min(room)]);

        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1], io);
        }
    }

    fn emit(&self, raw: &[u8], io: &ExecutionIo) {
        let text = String::from_utf8_lossy(raw);
        let text = text.strip_suffix('\r').unwrap_or(&text);
        match io.prefix.as_deref() {
            Some(prefix) => io.log.line(self.kind, &format!("{}{}", prefix, text)),
            None => io.log.line(self.kind, text),
        }
    }

    fn flush(&mut self, io: &ExecutionIo) {
        if self.pending.is_empty() {
            return;
        }
        let rest = std::mem::take(&mut self.pending);
        self.emit(&rest, io);
    }

    fn into_output(self) -> CapturedOutput {
        CapturedOutput {
            text: String::from_utf8_lossy(&self.captured).to_string(),
            total_bytes: self.total,
            truncated: self.truncated,
        }
    }
}
