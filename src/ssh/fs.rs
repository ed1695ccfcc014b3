use crate::errors::StepError;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFileKind {
    File,
    Directory,
    Other,
}

/// A filesystem that can be asked whether a path exists and what it is.
pub trait RemoteFs {
    /// `Ok(None)` when the path does not exist; other failures are errors.
    fn stat(&self, path: &str) -> Result<Option<RemoteFileKind>, StepError>;
}

/// A job workspace: stat'ed like a remote filesystem, read from locally.
pub trait Workspace: RemoteFs + Send + Sync {
    /// Where a workspace entry can be read from on this machine.
    fn local_path(&self, reference: &str) -> PathBuf;
}

/// A job workspace living on the machine that runs the engine.
#[derive(Debug, Clone)]
pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Workspace for LocalWorkspace {
    fn local_path(&self, reference: &str) -> PathBuf {
        self.root.join(reference.trim())
    }
}

impl RemoteFs for LocalWorkspace {
    fn stat(&self, path: &str) -> Result<Option<RemoteFileKind>, StepError> {
        let resolved = self.local_path(path);
        match std::fs::metadata(&resolved) {
            Ok(meta) if meta.is_dir() => Ok(Some(RemoteFileKind::Directory)),
            Ok(meta) if meta.is_file() => Ok(Some(RemoteFileKind::File)),
            Ok(_) => Ok(Some(RemoteFileKind::Other)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StepError::internal(format!(
                "Failed to stat {}: {}",
                resolved.display(),
                err
            ))),
        }
    }
}

/// Joins a reference onto a remote directory using `/` separators.
pub fn join_remote(dir: Option<&str>, reference: &str) -> String {
    let reference = reference.trim();
    match dir.map(str::trim).filter(|d| !d.is_empty()) {
        Some(_) if reference.starts_with('/') => reference.to_string(),
        Some(dir) => {
            let reference = reference.strip_prefix("./").unwrap_or(reference);
            format!("{}/{}", dir.trim_end_matches('/'), reference)
        }
        None => reference.to_string(),
    }
}

/// Folds `.` and `..` segments and repeated slashes out of a remote path.
/// `..` never climbs above `/`; on relative paths leading `..` are kept.
pub fn normalize_remote(path: &str) -> String {
    let path = path.trim();
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

pub fn remote_file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}
