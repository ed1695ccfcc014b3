#![allow(dead_code)]

use once_cell::sync::Lazy;
use sshsteps::config::EngineConfig;
use sshsteps::errors::{ConnectionFailure, StepError};
use sshsteps::managers::steps::StepRunner;
use sshsteps::services::context::StepContext;
use sshsteps::services::credentials::{Credential, CredentialResolver, StaticCredentials};
use sshsteps::services::log_sink::MemorySink;
use sshsteps::services::logger::Logger;
use sshsteps::ssh::channel::{ChannelExit, ExecChannel};
use sshsteps::ssh::executor::{
    CapturedOutput, ChannelExecutor, CommandExecutor, ExecutionIo, ExecutionRequest,
    ExecutionResult,
};
use sshsteps::ssh::factory::SessionFactory;
use sshsteps::ssh::fs::{RemoteFileKind, RemoteFs};
use sshsteps::ssh::session::{Interrupt, TransportSession};
use sshsteps::ssh::target::RemoteTarget;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;

pub static ENV_LOCK: Lazy<AsyncMutex<()>> = Lazy::new(|| AsyncMutex::new(()));

pub fn tmp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create tmp dir");
    dir
}

pub fn target() -> RemoteTarget {
    RemoteTarget::new("web", "10.0.0.5", "deploy", "deploy-key").allowing_any_hosts()
}

pub fn credentials() -> StaticCredentials {
    StaticCredentials::new().with("deploy-key", Credential::Password("s3cret".to_string()))
}

/// What one fake channel should produce.
#[derive(Debug, Clone, Default)]
pub struct ChannelScript {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: Option<i32>,
    /// Never reaches EOF on its own.
    pub hang: bool,
    /// The remote side never confirms a forced close.
    pub ignores_close: bool,
    pub fail_exec: bool,
}

impl ChannelScript {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn stdout(mut self, chunks: &[&str]) -> Self {
        self.stdout = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn stderr(mut self, chunks: &[&str]) -> Self {
        self.stderr = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct ChannelRecord {
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub pty: bool,
    pub stdin: Vec<u8>,
    pub eof_sent: bool,
    pub closed: bool,
}

pub struct FakeChannel {
    stdout: VecDeque<Vec<u8>>,
    stderr: VecDeque<Vec<u8>>,
    exit_code: Option<i32>,
    hang: bool,
    ignores_close: bool,
    fail_exec: bool,
    closed: bool,
    record: Arc<Mutex<ChannelRecord>>,
}

impl FakeChannel {
    pub fn new(script: ChannelScript, record: Arc<Mutex<ChannelRecord>>) -> Self {
        Self {
            stdout: script.stdout.into_iter().map(String::into_bytes).collect(),
            stderr: script.stderr.into_iter().map(String::into_bytes).collect(),
            exit_code: script.exit_code,
            hang: script.hang,
            ignores_close: script.ignores_close,
            fail_exec: script.fail_exec,
            closed: false,
            record,
        }
    }

    fn read_from(
        queue: &mut VecDeque<Vec<u8>>,
        hang: bool,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        match queue.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    queue.push_front(chunk[n..].to_vec());
                }
                Ok(n)
            }
            None if hang => Err(io::Error::new(io::ErrorKind::WouldBlock, "no data")),
            None => Ok(0),
        }
    }
}

impl ExecChannel for FakeChannel {
    fn exec(
        &mut self,
        command: &str,
        env: &BTreeMap<String, String>,
        pty: bool,
    ) -> Result<(), StepError> {
        let mut record = self.record.lock().unwrap();
        record.command = command.to_string();
        record.env = env.clone();
        record.pty = pty;
        if self.fail_exec {
            return Err(StepError::internal("exec refused"));
        }
        Ok(())
    }

    fn write_stdin(&mut self, data: &[u8]) -> io::Result<usize> {
        self.record.lock().unwrap().stdin.extend_from_slice(data);
        Ok(data.len())
    }

    fn send_eof(&mut self) -> io::Result<()> {
        self.record.lock().unwrap().eof_sent = true;
        Ok(())
    }

    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Self::read_from(&mut self.stdout, self.hang && !self.closed, buf)
    }

    fn read_stderr(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Self::read_from(&mut self.stderr, self.hang && !self.closed, buf)
    }

    // Stdout finishing first leaves stderr for the post-EOF drain.
    fn eof(&self) -> bool {
        self.closed || (!self.hang && self.stdout.is_empty())
    }

    fn finish(&mut self) -> ChannelExit {
        self.close();
        ChannelExit {
            exit_code: self.exit_code,
            signal: None,
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.record.lock().unwrap().closed = true;
    }

    fn close_within(&mut self, _grace: Duration) -> bool {
        self.close();
        !self.ignores_close
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Shared view of everything fake sessions did.
#[derive(Default)]
pub struct RemoteState {
    pub entries: BTreeMap<String, RemoteFileKind>,
    pub contents: BTreeMap<String, Vec<u8>>,
    pub scripts: VecDeque<ChannelScript>,
    pub channels: Vec<Arc<Mutex<ChannelRecord>>>,
    pub stats: Vec<String>,
    pub uploads: Vec<(String, Vec<u8>)>,
    pub removed: Vec<String>,
    /// Uploads hang until the session is interrupted.
    pub blocking_uploads: bool,
    pub interrupts: usize,
    pub opened: usize,
    pub closes: usize,
    pub aborts: usize,
}

impl RemoteState {
    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.entries.insert(path.to_string(), RemoteFileKind::File);
        self.contents
            .insert(path.to_string(), content.as_bytes().to_vec());
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.entries
            .insert(path.to_string(), RemoteFileKind::Directory);
        self
    }

    pub fn with_script(mut self, script: ChannelScript) -> Self {
        self.scripts.push_back(script);
        self
    }

    pub fn with_blocking_uploads(mut self) -> Self {
        self.blocking_uploads = true;
        self
    }

    pub fn last_command(&self) -> Option<String> {
        self.channels
            .last()
            .map(|record| record.lock().unwrap().command.clone())
    }
}

pub type SharedState = Arc<Mutex<RemoteState>>;

pub struct FakeSession {
    target: RemoteTarget,
    state: SharedState,
    interrupted: Arc<AtomicBool>,
    closed: bool,
}

struct FakeInterrupt {
    state: SharedState,
    interrupted: Arc<AtomicBool>,
}

impl Interrupt for FakeInterrupt {
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.state.lock().unwrap().interrupts += 1;
    }
}

impl FakeSession {
    pub fn new(target: RemoteTarget, state: SharedState) -> Self {
        state.lock().unwrap().opened += 1;
        Self {
            target,
            state,
            interrupted: Arc::new(AtomicBool::new(false)),
            closed: false,
        }
    }

    fn wait_for_interrupt(&self) -> Result<(), StepError> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.interrupted.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return Err(StepError::internal("upload never interrupted"));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Err(StepError::internal("connection reset"))
    }

    fn ensure_open(&self) -> Result<(), StepError> {
        if self.closed {
            return Err(StepError::internal("SSH session is closed"));
        }
        Ok(())
    }
}

impl RemoteFs for FakeSession {
    fn stat(&self, path: &str) -> Result<Option<RemoteFileKind>, StepError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        state.stats.push(path.to_string());
        Ok(state.entries.get(path).copied())
    }
}

impl TransportSession for FakeSession {
    fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn open_channel(&mut self) -> Result<Box<dyn ExecChannel>, StepError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        let script = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| ChannelScript::exit(0));
        let record = Arc::new(Mutex::new(ChannelRecord::default()));
        state.channels.push(Arc::clone(&record));
        Ok(Box::new(FakeChannel::new(script, record)))
    }

    fn list_dir(&mut self, remote_dir: &str) -> Result<Vec<(String, RemoteFileKind)>, StepError> {
        self.ensure_open()?;
        let prefix = format!("{}/", remote_dir.trim_end_matches('/'));
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .filter_map(|(path, kind)| {
                let rest = path.strip_prefix(&prefix)?;
                (!rest.is_empty() && !rest.contains('/')).then(|| (rest.to_string(), *kind))
            })
            .collect())
    }

    fn mkdir_all(&mut self, remote_dir: &str) -> Result<(), StepError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        let mut current = String::new();
        for part in remote_dir.split('/').filter(|p| !p.is_empty()) {
            if remote_dir.starts_with('/') || !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            state
                .entries
                .entry(current.clone())
                .or_insert(RemoteFileKind::Directory);
        }
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, StepError> {
        self.ensure_open()?;
        if self.state.lock().unwrap().blocking_uploads {
            self.wait_for_interrupt()?;
        }
        let bytes = std::fs::read(local)?;
        let len = bytes.len() as u64;
        let mut state = self.state.lock().unwrap();
        state
            .entries
            .insert(remote.to_string(), RemoteFileKind::File);
        state.contents.insert(remote.to_string(), bytes.clone());
        state.uploads.push((remote.to_string(), bytes));
        Ok(len)
    }

    fn download(&mut self, remote: &str, local: &Path) -> Result<u64, StepError> {
        self.ensure_open()?;
        let bytes = self
            .state
            .lock()
            .unwrap()
            .contents
            .get(remote)
            .cloned()
            .ok_or_else(|| StepError::internal(format!("no such file: {}", remote)))?;
        std::fs::write(local, &bytes)?;
        Ok(bytes.len() as u64)
    }

    fn remove_file(&mut self, remote: &str) -> Result<(), StepError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        state.entries.remove(remote);
        state.contents.remove(remote);
        state.removed.push(remote.to_string());
        Ok(())
    }

    fn remove_dir(&mut self, remote: &str) -> Result<(), StepError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();
        state.entries.remove(remote);
        state.removed.push(remote.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<(), StepError> {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().closes += 1;
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.state.lock().unwrap().aborts += 1;
        let _ = self.close();
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        Some(Arc::new(FakeInterrupt {
            state: Arc::clone(&self.state),
            interrupted: Arc::clone(&self.interrupted),
        }))
    }
}

/// Hands out fake sessions over one shared remote state, counting calls.
pub struct RecordingFactory {
    pub state: SharedState,
    pub calls: AtomicUsize,
    pub failure: Option<ConnectionFailure>,
}

impl RecordingFactory {
    pub fn new(state: RemoteState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            calls: AtomicUsize::new(0),
            failure: None,
        }
    }

    pub fn failing(failure: ConnectionFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::new(RemoteState::default())
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SessionFactory for RecordingFactory {
    fn create(
        &self,
        target: &RemoteTarget,
        _verbose: bool,
        _strict_host_key_checking: bool,
        credentials: &dyn CredentialResolver,
    ) -> Result<Box<dyn TransportSession>, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = &self.failure {
            return Err(StepError::connection(failure.clone()));
        }
        credentials.resolve(&target.credential_id)?;
        Ok(Box::new(FakeSession::new(
            target.clone(),
            Arc::clone(&self.state),
        )))
    }
}

/// Records requests instead of running them.
pub struct RecordingExecutor {
    pub requests: Mutex<Vec<ExecutionRequest>>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl RecordingExecutor {
    pub fn exiting(exit_code: i32) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            exit_code: Some(exit_code),
            timed_out: false,
        }
    }

    pub fn timing_out() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            exit_code: None,
            timed_out: true,
        }
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(
        &self,
        _session: &mut dyn TransportSession,
        request: &ExecutionRequest,
        _io: &ExecutionIo,
    ) -> Result<ExecutionResult, StepError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(ExecutionResult {
            exit_code: self.exit_code,
            timed_out: self.timed_out,
            hard_timed_out: false,
            signal: None,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            duration_ms: 5,
        })
    }
}

pub fn runner(factory: Arc<dyn SessionFactory>, executor: Arc<dyn CommandExecutor>) -> StepRunner {
    StepRunner::new(
        factory,
        Arc::new(credentials()),
        executor,
        Logger::new("test"),
        EngineConfig::default(),
    )
}

pub fn channel_executor() -> Arc<ChannelExecutor> {
    let config = EngineConfig {
        poll_interval_ms: 1,
        ..EngineConfig::default()
    };
    Arc::new(
        ChannelExecutor::new(Logger::new("test"), &config)
            .with_close_grace(Duration::from_millis(20)),
    )
}

pub fn context() -> (StepContext, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    (StepContext::new("job#1", sink.clone()), sink)
}
