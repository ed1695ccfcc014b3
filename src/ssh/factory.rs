use super::channel::ExecChannel;
use super::fs::{RemoteFileKind, RemoteFs};
use super::session::{Interrupt, Ssh2Session, TransportSession};
use super::target::RemoteTarget;
use crate::errors::StepError;
use crate::services::credentials::CredentialResolver;
use crate::services::logger::{LogLevel, Logger};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// The single entry point for obtaining sessions.
///
/// Errors are returned before any session object exists, so a session that
/// failed to open can never reach an executor.
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        target: &RemoteTarget,
        verbose: bool,
        strict_host_key_checking: bool,
        credentials: &dyn CredentialResolver,
    ) -> Result<Box<dyn TransportSession>, StepError>;
}

/// Opens a fresh connection for every call.
#[derive(Debug, Clone)]
pub struct Ssh2SessionFactory {
    logger: Logger,
}

impl Ssh2SessionFactory {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("ssh"),
        }
    }
}

impl SessionFactory for Ssh2SessionFactory {
    fn create(
        &self,
        target: &RemoteTarget,
        verbose: bool,
        strict_host_key_checking: bool,
        credentials: &dyn CredentialResolver,
    ) -> Result<Box<dyn TransportSession>, StepError> {
        let credential = credentials.resolve(&target.credential_id)?;
        let logger = if verbose {
            self.logger.clone().with_level(LogLevel::Debug)
        } else {
            self.logger.clone()
        };
        let session = Ssh2Session::open(target, &credential, strict_host_key_checking, &logger)?;
        Ok(Box::new(session))
    }
}

type IdleSessions = HashMap<PoolKey, Vec<Box<dyn TransportSession>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    target: RemoteTarget,
    strict: bool,
}

/// Keeps released sessions per target and hands them out as exclusive leases.
pub struct PooledSessionFactory {
    inner: Arc<dyn SessionFactory>,
    idle: Arc<Mutex<IdleSessions>>,
    shut_down: Arc<AtomicBool>,
    max_idle_per_target: usize,
    logger: Logger,
}

impl PooledSessionFactory {
    pub fn new(inner: Arc<dyn SessionFactory>, logger: Logger) -> Self {
        Self {
            inner,
            idle: Arc::new(Mutex::new(HashMap::new())),
            shut_down: Arc::new(AtomicBool::new(false)),
            max_idle_per_target: 4,
            logger: logger.child("pool"),
        }
    }

    pub fn with_max_idle_per_target(mut self, max: usize) -> Self {
        self.max_idle_per_target = max;
        self
    }

    pub fn idle_count(&self, target: &RemoteTarget) -> usize {
        lock(&self.idle)
            .iter()
            .filter(|(key, _)| &key.target == target)
            .map(|(_, sessions)| sessions.len())
            .sum()
    }

    /// Closes every idle session. Leases still out are closed when released.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let drained: Vec<Box<dyn TransportSession>> = lock(&self.idle)
            .drain()
            .flat_map(|(_, sessions)| sessions)
            .collect();
        let count = drained.len();
        for mut session in drained {
            let _ = session.close();
        }
        self.logger.debug(
            "pool shut down",
            Some(&serde_json::json!({ "closed": count })),
        );
    }

    fn checkout(&self, key: &PoolKey) -> Option<Box<dyn TransportSession>> {
        let mut idle = lock(&self.idle);
        let sessions = idle.get_mut(key)?;
        while let Some(session) = sessions.pop() {
            if !session.is_closed() {
                return Some(session);
            }
        }
        None
    }
}

impl SessionFactory for PooledSessionFactory {
    fn create(
        &self,
        target: &RemoteTarget,
        verbose: bool,
        strict_host_key_checking: bool,
        credentials: &dyn CredentialResolver,
    ) -> Result<Box<dyn TransportSession>, StepError> {
        let key = PoolKey {
            target: target.clone(),
            strict: strict_host_key_checking,
        };
        let session = match self.checkout(&key) {
            Some(session) => {
                self.logger.debug(
                    "reusing idle session",
                    Some(&serde_json::json!({ "remote": target.name })),
                );
                session
            }
            None => self
                .inner
                .create(target, verbose, strict_host_key_checking, credentials)?,
        };
        Ok(Box::new(LeasedSession {
            session: Some(session),
            key,
            idle: Arc::clone(&self.idle),
            shut_down: Arc::clone(&self.shut_down),
            max_idle: self.max_idle_per_target,
        }))
    }
}

impl Drop for PooledSessionFactory {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A session borrowed from the pool. Dropping a lease without releasing it
/// discards the session.
pub struct LeasedSession {
    session: Option<Box<dyn TransportSession>>,
    key: PoolKey,
    idle: Arc<Mutex<IdleSessions>>,
    shut_down: Arc<AtomicBool>,
    max_idle: usize,
}

impl LeasedSession {
    fn live(&mut self) -> Result<&mut Box<dyn TransportSession>, StepError> {
        self.session
            .as_mut()
            .ok_or_else(|| StepError::internal("SSH session lease was released"))
    }
}

impl RemoteFs for LeasedSession {
    fn stat(&self, path: &str) -> Result<Option<RemoteFileKind>, StepError> {
        match self.session.as_ref() {
            Some(session) => session.stat(path),
            None => Err(StepError::internal("SSH session lease was released")),
        }
    }
}

impl TransportSession for LeasedSession {
    fn target(&self) -> &RemoteTarget {
        &self.key.target
    }

    fn open_channel(&mut self) -> Result<Box<dyn ExecChannel>, StepError> {
        self.live()?.open_channel()
    }

    fn list_dir(&mut self, remote_dir: &str) -> Result<Vec<(String, RemoteFileKind)>, StepError> {
        self.live()?.list_dir(remote_dir)
    }

    fn mkdir_all(&mut self, remote_dir: &str) -> Result<(), StepError> {
        self.live()?.mkdir_all(remote_dir)
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, StepError> {
        self.live()?.upload(local, remote)
    }

    fn download(&mut self, remote: &str, local: &Path) -> Result<u64, StepError> {
        self.live()?.download(remote, local)
    }

    fn remove_file(&mut self, remote: &str) -> Result<(), StepError> {
        self.live()?.remove_file(remote)
    }

    fn remove_dir(&mut self, remote: &str) -> Result<(), StepError> {
        self.live()?.remove_dir(remote)
    }

    fn close(&mut self) -> Result<(), StepError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if session.is_closed() {
            return Ok(());
        }
        let mut idle = lock(&self.idle);
        // Checked under the lock so a concurrent shutdown cannot miss this session.
        if self.shut_down.load(Ordering::SeqCst) {
            drop(idle);
            return session.close();
        }
        let slot = idle.entry(self.key.clone()).or_default();
        if slot.len() < self.max_idle {
            slot.push(session);
            Ok(())
        } else {
            drop(idle);
            session.close()
        }
    }

    fn abort(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        self.session.as_ref()?.interrupt_handle()
    }
}

impl Drop for LeasedSession {
    fn drop(&mut self) {
        self.abort();
    }
}

fn lock(idle: &Mutex<IdleSessions>) -> MutexGuard<'_, IdleSessions> {
    idle.lock().unwrap_or_else(|err| err.into_inner())
}
