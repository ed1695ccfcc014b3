use super::{StepCall, StepReport, StepStrategy, TransferReport};
use crate::errors::StepError;
use crate::services::context::StepContext;
use crate::services::validation::Validation;
use crate::utils::paths::resolve_local;
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Uploads a local file or directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutStep {
    pub from: String,
    pub into: String,
}

#[derive(Debug)]
pub struct PutPlan {
    local: PathBuf,
    remote: String,
    directory: bool,
}

impl PutStep {
    pub fn new(from: impl Into<String>, into: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            into: into.into(),
        }
    }

    pub fn from_value(args: &Value) -> Self {
        let read = |key: &str| args.get(key).and_then(|v| v.as_str()).unwrap_or("");
        Self::new(read("from"), read("into"))
    }

    fn local_source(&self, ctx: &StepContext) -> PathBuf {
        resolve_local(&ctx.local_dir, &self.from)
    }
}

impl StepStrategy for PutStep {
    type Plan = PutPlan;

    fn name(&self) -> &'static str {
        "put"
    }

    fn validate(&self, validation: &Validation, ctx: &StepContext) -> Result<(), StepError> {
        validation.ensure_present(Some(&self.from), "from")?;
        validation.ensure_present(Some(&self.into), "into")?;
        if !self.local_source(ctx).exists() {
            return Err(StepError::validation(format!(
                "{} does not exist.",
                self.from.trim()
            )));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} -> {}", self.from.trim(), self.into.trim())
    }

    fn resolve(&self, call: &mut StepCall<'_>) -> Result<PutPlan, StepError> {
        let local = self.local_source(call.ctx);
        let mut remote = call.options.remote_path(self.into.trim());
        if remote.ends_with('/') {
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| {
                    StepError::validation(format!("{} has no file name", self.from.trim()))
                })?;
            remote.push_str(&name);
        }
        Ok(PutPlan {
            directory: local.is_dir(),
            local,
            remote,
        })
    }

    fn run(&self, call: &mut StepCall<'_>, plan: PutPlan) -> Result<StepReport, StepError> {
        call.status(&format!(
            "Sending {} to {}",
            plan.local.display(),
            plan.remote
        ));
        let mut report = TransferReport {
            from: plan.local.display().to_string(),
            into: plan.remote.clone(),
            ..TransferReport::default()
        };
        if !plan.directory {
            report.bytes = call.session.upload(&plan.local, &plan.remote)?;
            report.files = 1;
            return Ok(StepReport::transferred(report));
        }

        call.session.mkdir_all(&plan.remote)?;
        let walker = WalkDir::new(&plan.local)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();
        for entry in walker {
            call.ensure_not_cancelled()?;
            let entry = entry.map_err(|err| {
                StepError::internal(format!("Failed to read {}: {}", plan.local.display(), err))
            })?;
            let remote = remote_child(&plan.remote, &plan.local, entry.path());
            if entry.file_type().is_dir() {
                call.session.mkdir_all(&remote)?;
            } else if entry.file_type().is_file() {
                report.bytes += call.session.upload(entry.path(), &remote)?;
                report.files += 1;
            }
        }
        Ok(StepReport::transferred(report))
    }
}

fn remote_child(remote_root: &str, local_root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(local_root).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    format!("{}/{}", remote_root.trim_end_matches('/'), parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::remote_child;
    use std::path::Path;

    #[test]
    fn remote_child_uses_forward_slashes() {
        assert_eq!(
            remote_child("/srv/www/", Path::new("site"), Path::new("site/css/app.css")),
            "/srv/www/css/app.css"
        );
    }
}
