use super::{remote_missing, StepCall, StepReport, StepStrategy, TransferReport};
use crate::errors::StepError;
use crate::services::context::StepContext;
use crate::services::validation::Validation;
use crate::ssh::fs::{normalize_remote, RemoteFileKind};
use serde_json::Value;

/// Removes a remote file, or a directory and everything under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveStep {
    pub path: String,
}

impl RemoveStep {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_value(args: &Value) -> Self {
        Self::new(args.get("path").and_then(|v| v.as_str()).unwrap_or(""))
    }
}

fn is_root(path: &str) -> bool {
    normalize_remote(path) == "/"
}

impl StepStrategy for RemoveStep {
    type Plan = (String, RemoteFileKind);

    fn name(&self) -> &'static str {
        "remove"
    }

    fn validate(&self, validation: &Validation, _ctx: &StepContext) -> Result<(), StepError> {
        validation.ensure_present(Some(&self.path), "path")?;
        if is_root(&self.path) {
            return Err(StepError::validation("Removing the root directory is not allowed."));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.trim().to_string()
    }

    fn resolve(&self, call: &mut StepCall<'_>) -> Result<(String, RemoteFileKind), StepError> {
        let remote = normalize_remote(&call.options.remote_path(&self.path));
        if is_root(&remote) {
            return Err(StepError::validation("Removing the root directory is not allowed."));
        }
        let kind = call
            .session
            .stat(&remote)?
            .ok_or_else(|| remote_missing(&remote))?;
        Ok((remote, kind))
    }

    fn run(
        &self,
        call: &mut StepCall<'_>,
        (remote, kind): (String, RemoteFileKind),
    ) -> Result<StepReport, StepError> {
        call.status(&format!("Removing {}", remote));
        let mut report = TransferReport {
            from: remote.clone(),
            ..TransferReport::default()
        };
        match kind {
            RemoteFileKind::Directory => remove_tree(call, &remote, &mut report)?,
            _ => {
                call.session.remove_file(&remote)?;
                report.files = 1;
            }
        }
        Ok(StepReport::transferred(report))
    }
}

fn remove_tree(
    call: &mut StepCall<'_>,
    remote_dir: &str,
    report: &mut TransferReport,
) -> Result<(), StepError> {
    call.ensure_not_cancelled()?;
    let remote_dir = remote_dir.trim_end_matches('/');
    for (name, kind) in call.session.list_dir(remote_dir)? {
        let child = format!("{}/{}", remote_dir, name);
        match kind {
            RemoteFileKind::Directory => remove_tree(call, &child, report)?,
            _ => {
                call.session.remove_file(&child)?;
                report.files += 1;
            }
        }
    }
    call.session.remove_dir(remote_dir)
}

#[cfg(test)]
mod tests {
    use super::is_root;

    #[test]
    fn root_detection_sees_through_dot_segments() {
        assert!(is_root("/"));
        assert!(is_root("///"));
        assert!(is_root("/."));
        assert!(is_root("/./"));
        assert!(is_root("/srv/.."));
        assert!(is_root(" /srv/app/../../ "));
        assert!(!is_root("/srv"));
        assert!(!is_root("build/.."));
    }
}
