use super::fs::{join_remote, RemoteFileKind, RemoteFs, Workspace};
use crate::errors::StepError;
use crate::services::logger::Logger;
use std::path::PathBuf;

/// What a script reference turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPath {
    /// An existing regular file on the remote host; holds the path joined
    /// onto the working directory.
    RemoteFile(String),
    /// An existing regular file in the job workspace. Its content has to be
    /// shipped to the remote host before it can run there.
    WorkspaceFile(PathBuf),
    /// Anything else; holds the raw reference, to be run as script text.
    InlineText(String),
}

#[derive(Debug, Clone)]
pub struct RemotePathResolver {
    logger: Logger,
}

impl RemotePathResolver {
    pub fn new(logger: Logger) -> Self {
        Self {
            logger: logger.child("resolver"),
        }
    }

    /// Looks the reference up on the remote host, relative to the working directory.
    pub fn resolve<F: RemoteFs + ?Sized>(
        &self,
        fs: &F,
        reference: &str,
        working_dir: Option<&str>,
    ) -> Result<ResolvedPath, StepError> {
        let candidate = join_remote(working_dir, reference);
        let resolved = if self.is_file(fs, reference, &candidate)? {
            ResolvedPath::RemoteFile(candidate)
        } else {
            ResolvedPath::InlineText(reference.to_string())
        };
        self.log(reference, &resolved);
        Ok(resolved)
    }

    /// Looks the reference up in the job workspace. The remote working directory plays no part here.
    pub fn resolve_in_workspace(
        &self,
        workspace: &dyn Workspace,
        reference: &str,
    ) -> Result<ResolvedPath, StepError> {
        let candidate = join_remote(None, reference);
        let resolved = if self.is_file(workspace, reference, &candidate)? {
            ResolvedPath::WorkspaceFile(workspace.local_path(&candidate))
        } else {
            ResolvedPath::InlineText(reference.to_string())
        };
        self.log(reference, &resolved);
        Ok(resolved)
    }

    fn is_file<F: RemoteFs + ?Sized>(
        &self,
        fs: &F,
        reference: &str,
        candidate: &str,
    ) -> Result<bool, StepError> {
        if reference.trim().contains('\n') {
            return Ok(false);
        }
        // Directories and special files are not scripts.
        Ok(fs.stat(candidate)? == Some(RemoteFileKind::File))
    }

    fn log(&self, reference: &str, resolved: &ResolvedPath) {
        let source = match resolved {
            ResolvedPath::RemoteFile(_) => "remote",
            ResolvedPath::WorkspaceFile(_) => "workspace",
            ResolvedPath::InlineText(_) => "inline",
        };
        self.logger.debug(
            "reference resolved",
            Some(&serde_json::json!({
                "reference": reference,
                "source": source,
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MapFs {
        entries: HashMap<String, RemoteFileKind>,
        statted: RefCell<Vec<String>>,
    }

    impl MapFs {
        fn new(entries: &[(&str, RemoteFileKind)]) -> Self {
            Self {
                entries: entries
                    .iter()
                    .map(|(path, kind)| (path.to_string(), *kind))
                    .collect(),
                statted: RefCell::new(Vec::new()),
            }
        }
    }

    impl RemoteFs for MapFs {
        fn stat(&self, path: &str) -> Result<Option<RemoteFileKind>, StepError> {
            self.statted.borrow_mut().push(path.to_string());
            if path == "/broken" {
                return Err(StepError::internal("permission denied"));
            }
            Ok(self.entries.get(path).copied())
        }
    }

    fn resolver() -> RemotePathResolver {
        RemotePathResolver::new(Logger::new("test"))
    }

    #[test]
    fn existing_file_resolves_to_joined_path() {
        let fs = MapFs::new(&[("/srv/app/deploy.sh", RemoteFileKind::File)]);
        let resolved = resolver()
            .resolve(&fs, "deploy.sh", Some("/srv/app"))
            .unwrap();
        assert_eq!(resolved, ResolvedPath::RemoteFile("/srv/app/deploy.sh".to_string()));
    }

    #[test]
    fn directory_falls_back_to_inline_text() {
        let fs = MapFs::new(&[("scripts", RemoteFileKind::Directory)]);
        let resolved = resolver().resolve(&fs, "scripts", None).unwrap();
        assert_eq!(resolved, ResolvedPath::InlineText("scripts".to_string()));
    }

    #[test]
    fn multi_line_reference_is_never_statted() {
        let fs = MapFs::new(&[]);
        let script = "set -e\nmake test";
        let resolved = resolver().resolve(&fs, script, None).unwrap();
        assert_eq!(resolved, ResolvedPath::InlineText(script.to_string()));
        assert!(fs.statted.borrow().is_empty());
    }

    #[test]
    fn raw_reference_is_kept_for_inline_text() {
        let fs = MapFs::new(&[]);
        let resolved = resolver().resolve(&fs, "  uptime ", None).unwrap();
        assert_eq!(resolved, ResolvedPath::InlineText("  uptime ".to_string()));
        assert_eq!(fs.statted.borrow().as_slice(), ["uptime"]);
    }

    #[test]
    fn stat_failures_propagate() {
        let fs = MapFs::new(&[]);
        assert!(resolver().resolve(&fs, "/broken", None).is_err());
    }
}
