use super::{remote_missing, StepCall, StepReport, StepStrategy, TransferReport};
use crate::errors::StepError;
use crate::services::context::StepContext;
use crate::services::validation::Validation;
use crate::ssh::fs::{remote_file_name, RemoteFileKind};
use crate::utils::paths::resolve_local;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Downloads a remote file or directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetStep {
    pub from: String,
    pub into: String,
    pub override_existing: bool,
}

#[derive(Debug)]
pub struct GetPlan {
    remote: String,
    local: PathBuf,
    kind: RemoteFileKind,
}

impl GetStep {
    pub fn new(from: impl Into<String>, into: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            into: into.into(),
            override_existing: false,
        }
    }

    pub fn overriding(mut self, override_existing: bool) -> Self {
        self.override_existing = override_existing;
        self
    }

    pub fn from_value(args: &Value) -> Self {
        let read = |key: &str| args.get(key).and_then(|v| v.as_str()).unwrap_or("");
        Self::new(read("from"), read("into")).overriding(
            args.get("override_existing")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        )
    }

    /// An existing local directory (or an `into` ending in `/`) receives the remote name.
    fn local_destination(&self, ctx: &StepContext) -> PathBuf {
        let into = self.into.trim();
        let base = resolve_local(&ctx.local_dir, into);
        if base.is_dir() || into.ends_with('/') {
            base.join(remote_file_name(self.from.trim()))
        } else {
            base
        }
    }
}

impl StepStrategy for GetStep {
    type Plan = GetPlan;

    fn name(&self) -> &'static str {
        "get"
    }

    fn validate(&self, validation: &Validation, ctx: &StepContext) -> Result<(), StepError> {
        validation.ensure_present(Some(&self.from), "from")?;
        validation.ensure_present(Some(&self.into), "into")?;
        let destination = self.local_destination(ctx);
        if destination.exists() && !self.override_existing {
            return Err(StepError::validation(format!(
                "{} already exists.",
                destination.display()
            ))
            .with_hint("Set override_existing to replace it."));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} -> {}", self.from.trim(), self.into.trim())
    }

    fn resolve(&self, call: &mut StepCall<'_>) -> Result<GetPlan, StepError> {
        let remote = call.options.remote_path(self.from.trim());
        let kind = call
            .session
            .stat(&remote)?
            .ok_or_else(|| remote_missing(&remote))?;
        Ok(GetPlan {
            remote,
            local: self.local_destination(call.ctx),
            kind,
        })
    }

    fn run(&self, call: &mut StepCall<'_>, plan: GetPlan) -> Result<StepReport, StepError> {
        call.status(&format!(
            "Receiving {} into {}",
            plan.remote,
            plan.local.display()
        ));
        let mut report = TransferReport {
            from: plan.remote.clone(),
            into: plan.local.display().to_string(),
            ..TransferReport::default()
        };
        match plan.kind {
            RemoteFileKind::Directory => download_tree(call, &plan.remote, &plan.local, &mut report)?,
            _ => {
                ensure_parent(&plan.local)?;
                report.bytes = call.session.download(&plan.remote, &plan.local)?;
                report.files = 1;
            }
        }
        Ok(StepReport::transferred(report))
    }
}

fn download_tree(
    call: &mut StepCall<'_>,
    remote_root: &str,
    local_root: &Path,
    report: &mut TransferReport,
) -> Result<(), StepError> {
    let mut pending = vec![(remote_root.trim_end_matches('/').to_string(), local_root.to_path_buf())];
    while let Some((remote_dir, local_dir)) = pending.pop() {
        call.ensure_not_cancelled()?;
        fs::create_dir_all(&local_dir)?;
        for (name, kind) in call.session.list_dir(&remote_dir)? {
            let remote = format!("{}/{}", remote_dir, name);
            let local = local_dir.join(&name);
            match kind {
                RemoteFileKind::Directory => pending.push((remote, local)),
                RemoteFileKind::File => {
                    report.bytes += call.session.download(&remote, &local)?;
                    report.files += 1;
                }
                // Sockets, devices and links are skipped.
                RemoteFileKind::Other => {}
            }
        }
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<(), StepError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
