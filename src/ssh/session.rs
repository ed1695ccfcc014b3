use super::channel::{ExecChannel, Ssh2Channel};
use super::fs::{RemoteFileKind, RemoteFs};
use super::target::RemoteTarget;
use crate::errors::{ConnectionFailure, StepError};
use crate::services::credentials::Credential;
use crate::services::logger::Logger;
use crate::utils::paths::{expand_home_path, temp_sibling_path};
use base64::Engine;
use ssh2::{CheckResult, KnownHostFileKind, OpenFlags, OpenType, Session};
use std::fs;
use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One authenticated connection to a remote host.
///
/// Implementations must make `close` idempotent: it is called from success,
/// failure and drop paths alike.
pub trait TransportSession: RemoteFs + Send {
    fn target(&self) -> &RemoteTarget;
    fn open_channel(&mut self) -> Result<Box<dyn ExecChannel>, StepError>;
    fn list_dir(&mut self, remote_dir: &str) -> Result<Vec<(String, RemoteFileKind)>, StepError>;
    fn mkdir_all(&mut self, remote_dir: &str) -> Result<(), StepError>;
    fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, StepError>;
    fn download(&mut self, remote: &str, local: &Path) -> Result<u64, StepError>;
    fn remove_file(&mut self, remote: &str) -> Result<(), StepError>;
    fn remove_dir(&mut self, remote: &str) -> Result<(), StepError>;
    fn close(&mut self) -> Result<(), StepError>;
    /// Release after a failure. Pooled sessions are discarded instead of returned.
    fn abort(&mut self) {
        let _ = self.close();
    }
    fn is_closed(&self) -> bool;
    /// A handle that breaks the connection from another thread, unblocking
    /// whatever call is in flight.
    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }
}

pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// Shuts the socket under a session down in both directions.
struct SocketInterrupt(TcpStream);

impl Interrupt for SocketInterrupt {
    fn interrupt(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

pub struct Ssh2Session {
    target: RemoteTarget,
    session: Option<Session>,
    socket: Option<TcpStream>,
    logger: Logger,
    opened_at: Instant,
}

impl Ssh2Session {
    pub fn open(
        target: &RemoteTarget,
        credential: &Credential,
        strict_host_key_checking: bool,
        logger: &Logger,
    ) -> Result<Self, StepError> {
        let timeout = Duration::from_millis(target.connect_timeout_ms);
        let tcp = connect_tcp(target, timeout)?;
        tcp.set_read_timeout(Some(timeout)).ok();
        tcp.set_write_timeout(Some(timeout)).ok();
        let socket = tcp.try_clone().ok();

        let mut session =
            Session::new().map_err(|_| StepError::internal("Failed to create SSH session"))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(target.connect_timeout_ms.min(u32::MAX as u64) as u32);
        session
            .handshake()
            .map_err(|err| handshake_failure(target, err))?;

        verify_host_key(&session, target, strict_host_key_checking)?;
        authenticate(&session, target, credential)?;

        let interval = std::cmp::max(1, (target.keepalive_interval_ms / 1000) as u32);
        session.set_keepalive(true, interval);

        logger.debug(
            "session opened",
            Some(&serde_json::json!({
                "remote": target.name,
                "address": target.address(),
                "auth": credential.method(),
            })),
        );
        Ok(Self {
            target: target.clone(),
            session: Some(session),
            socket,
            logger: logger.clone(),
            opened_at: Instant::now(),
        })
    }

    fn live(&self) -> Result<&Session, StepError> {
        self.session
            .as_ref()
            .ok_or_else(|| StepError::internal("SSH session is closed"))
    }

    fn sftp(&self) -> Result<ssh2::Sftp, StepError> {
        self.live()?.sftp().map_err(map_ssh_error)
    }
}

impl RemoteFs for Ssh2Session {
    fn stat(&self, path: &str) -> Result<Option<RemoteFileKind>, StepError> {
        let sftp = self.sftp()?;
        match sftp.stat(Path::new(path)) {
            Ok(stat) if stat.is_dir() => Ok(Some(RemoteFileKind::Directory)),
            Ok(stat) if stat.is_file() => Ok(Some(RemoteFileKind::File)),
            Ok(_) => Ok(Some(RemoteFileKind::Other)),
            Err(err) => {
                let io_err: io::Error = err.into();
                if io_err.kind() == io::ErrorKind::NotFound {
                    Ok(None)
                } else {
                    Err(StepError::internal(format!(
                        "SFTP stat {} failed: {}",
                        path, io_err
                    )))
                }
            }
        }
    }
}

impl TransportSession for Ssh2Session {
    fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn open_channel(&mut self) -> Result<Box<dyn ExecChannel>, StepError> {
        let session = self.live()?.clone();
        let channel = session.channel_session().map_err(map_ssh_error)?;
        Ok(Box::new(Ssh2Channel::new(session, channel)))
    }

    fn list_dir(&mut self, remote_dir: &str) -> Result<Vec<(String, RemoteFileKind)>, StepError> {
        let sftp = self.sftp()?;
        let entries = sftp.readdir(Path::new(remote_dir)).map_err(map_ssh_error)?;
        Ok(entries
            .into_iter()
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_string_lossy().to_string();
                if name == "." || name == ".." {
                    return None;
                }
                let kind = if stat.is_dir() {
                    RemoteFileKind::Directory
                } else if stat.is_file() {
                    RemoteFileKind::File
                } else {
                    RemoteFileKind::Other
                };
                Some((name, kind))
            })
            .collect())
    }

    fn mkdir_all(&mut self, remote_dir: &str) -> Result<(), StepError> {
        let sftp = self.sftp()?;
        let mut current = PathBuf::new();
        for part in Path::new(remote_dir).components() {
            current.push(part);
            if sftp.stat(&current).is_ok() {
                continue;
            }
            let _ = sftp.mkdir(&current, 0o755);
        }
        match sftp.stat(Path::new(remote_dir)) {
            Ok(stat) if stat.is_dir() => Ok(()),
            _ => Err(StepError::internal(format!(
                "Failed to create remote directory: {}",
                remote_dir
            ))),
        }
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<u64, StepError> {
        let sftp = self.sftp()?;
        let mut local_file = fs::File::open(local).map_err(|err| {
            StepError::validation(format!("{} must be readable: {}", local.display(), err))
        })?;
        let mut remote_file = sftp
            .open_mode(
                Path::new(remote),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                local_mode(local),
                OpenType::File,
            )
            .map_err(map_ssh_error)?;
        io::copy(&mut local_file, &mut remote_file)
            .map_err(|err| StepError::internal(format!("Upload to {} failed: {}", remote, err)))
    }

    fn download(&mut self, remote: &str, local: &Path) -> Result<u64, StepError> {
        let sftp = self.sftp()?;
        let mut remote_file = sftp.open(Path::new(remote)).map_err(map_ssh_error)?;
        let tmp_path = temp_sibling_path(local);
        let copied = (|| {
            let mut tmp_file = fs::File::create(&tmp_path)?;
            let copied = io::copy(&mut remote_file, &mut tmp_file)?;
            fs::rename(&tmp_path, local)?;
            Ok::<u64, io::Error>(copied)
        })();
        copied.map_err(|err| {
            let _ = fs::remove_file(&tmp_path);
            StepError::internal(format!("Download of {} failed: {}", remote, err))
        })
    }

    fn remove_file(&mut self, remote: &str) -> Result<(), StepError> {
        self.sftp()?
            .unlink(Path::new(remote))
            .map_err(map_ssh_error)
    }

    fn remove_dir(&mut self, remote: &str) -> Result<(), StepError> {
        self.sftp()?
            .rmdir(Path::new(remote))
            .map_err(map_ssh_error)
    }

    fn close(&mut self) -> Result<(), StepError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        session.set_blocking(true);
        let _ = session.disconnect(None, "sshsteps session closed", None);
        self.socket = None;
        self.logger.debug(
            "session closed",
            Some(&serde_json::json!({
                "remote": self.target.name,
                "open_ms": self.opened_at.elapsed().as_millis() as u64,
            })),
        );
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    fn interrupt_handle(&self) -> Option<Arc<dyn Interrupt>> {
        let socket = self.socket.as_ref()?.try_clone().ok()?;
        Some(Arc::new(SocketInterrupt(socket)))
    }
}

impl Drop for Ssh2Session {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn connect_tcp(target: &RemoteTarget, timeout: Duration) -> Result<TcpStream, StepError> {
    let unreachable = |reason: String| {
        StepError::connection(ConnectionFailure::Unreachable {
            host: target.host.clone(),
            port: target.port,
            reason,
        })
    };
    let addrs = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|err| unreachable(err.to_string()))?;
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_error = Some(err),
        }
    }
    Err(unreachable(
        last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "no addresses resolved".to_string()),
    ))
}

fn handshake_failure(target: &RemoteTarget, err: ssh2::Error) -> StepError {
    let io_err: io::Error = err.into();
    if matches!(
        io_err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    ) {
        return StepError::connection(ConnectionFailure::HandshakeTimeout {
            host: target.host.clone(),
            timeout_ms: target.connect_timeout_ms,
        });
    }
    StepError::connection(ConnectionFailure::Handshake {
        host: target.host.clone(),
        reason: io_err.to_string(),
    })
}

fn fingerprint_host_key_sha256(session: &Session) -> Option<String> {
    let hash = session.host_key_hash(ssh2::HashType::Sha256)?;
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    Some(format!("SHA256:{}", encoded))
}

fn verify_host_key(session: &Session, target: &RemoteTarget, strict: bool) -> Result<(), StepError> {
    let observed = fingerprint_host_key_sha256(session).unwrap_or_else(|| "unknown".to_string());
    if let Some(expected) = target.host_key_fingerprint.as_ref() {
        if *expected != observed {
            return Err(StepError::connection(ConnectionFailure::HostKeyMismatch {
                host: target.host.clone(),
                expected: expected.clone(),
                observed,
            }));
        }
        return Ok(());
    }
    if !strict {
        return Ok(());
    }

    let unknown = |observed: String| {
        StepError::connection(ConnectionFailure::HostKeyUnknown {
            host: target.host.clone(),
            observed,
        })
    };
    let Some((key, _)) = session.host_key() else {
        return Err(unknown(observed));
    };
    let known_hosts_path = target
        .known_hosts
        .clone()
        .unwrap_or_else(|| expand_home_path("~/.ssh/known_hosts"));
    let mut known_hosts = session.known_hosts().map_err(map_ssh_error)?;
    if known_hosts
        .read_file(&known_hosts_path, KnownHostFileKind::OpenSSH)
        .is_err()
    {
        return Err(unknown(observed));
    }
    match known_hosts.check_port(&target.host, target.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(StepError::connection(ConnectionFailure::HostKeyMismatch {
            host: target.host.clone(),
            expected: format!("entry in {}", known_hosts_path.display()),
            observed,
        })),
        CheckResult::NotFound | CheckResult::Failure => Err(unknown(observed)),
    }
}

fn authenticate(
    session: &Session,
    target: &RemoteTarget,
    credential: &Credential,
) -> Result<(), StepError> {
    let user = target.username.as_str();
    let attempt = match credential {
        Credential::Password(password) => session.userauth_password(user, password),
        Credential::PrivateKey { key, passphrase } => {
            session.userauth_pubkey_memory(user, None, key, passphrase.as_deref())
        }
        Credential::KeyFile { path, passphrase } => {
            session.userauth_pubkey_file(user, None, path, passphrase.as_deref())
        }
        Credential::Agent => session.userauth_agent(user),
    };
    let auth_failed = || {
        StepError::connection(ConnectionFailure::Authentication {
            username: target.username.clone(),
            host: target.host.clone(),
        })
    };
    if let Err(err) = attempt {
        let io_err: io::Error = err.into();
        if io_err.kind() == io::ErrorKind::TimedOut {
            return Err(StepError::connection(ConnectionFailure::HandshakeTimeout {
                host: target.host.clone(),
                timeout_ms: target.connect_timeout_ms,
            }));
        }
        return Err(auth_failed());
    }
    if !session.authenticated() {
        return Err(auth_failed());
    }
    Ok(())
}

#[cfg(unix)]
fn local_mode(path: &Path) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| (meta.permissions().mode() & 0o777) as i32)
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn local_mode(_path: &Path) -> i32 {
    0o644
}

pub(crate) fn map_ssh_error(err: ssh2::Error) -> StepError {
    let io_err: io::Error = err.into();
    match io_err.kind() {
        io::ErrorKind::TimedOut => StepError::timeout("SSH operation timed out"),
        io::ErrorKind::NotFound => StepError::internal(format!("No such remote file: {}", io_err)),
        _ => StepError::internal(format!("SSH error: {}", io_err)),
    }
}
