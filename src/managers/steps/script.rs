use super::{StepCall, StepReport, StepStrategy};
use crate::constants::limits;
use crate::errors::StepError;
use crate::services::context::StepContext;
use crate::services::validation::Validation;
use crate::ssh::executor::ExecutionPayload;
use crate::ssh::resolver::ResolvedPath;
use crate::utils::paths::staged_script_path;
use crate::utils::text::summarize_command;
use serde_json::Value;

/// Runs a script file when the reference names one, and the reference itself
/// as script text otherwise. A file found in the job workspace is copied to the
/// remote host first and removed after it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStep {
    pub script: String,
}

impl ScriptStep {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }

    pub fn from_value(args: &Value) -> Self {
        Self::new(args.get("script").and_then(|v| v.as_str()).unwrap_or(""))
    }
}

impl StepStrategy for ScriptStep {
    type Plan = ResolvedPath;

    fn name(&self) -> &'static str {
        "script"
    }

    fn validate(&self, validation: &Validation, _ctx: &StepContext) -> Result<(), StepError> {
        validation.ensure_present(Some(&self.script), "script")?;
        Ok(())
    }

    fn describe(&self) -> String {
        summarize_command(&self.script, limits::COMMAND_SUBSTRING_LENGTH)
    }

    fn resolve(&self, call: &mut StepCall<'_>) -> Result<ResolvedPath, StepError> {
        call.resolve_reference(&self.script)
    }

    fn run(&self, call: &mut StepCall<'_>, plan: ResolvedPath) -> Result<StepReport, StepError> {
        let payload = match plan {
            ResolvedPath::RemoteFile(path) => {
                call.status(&format!("Running script file {}", path));
                ExecutionPayload::ScriptFile(path)
            }
            ResolvedPath::WorkspaceFile(local) => {
                let staged = staged_script_path(&local);
                call.status(&format!("Copying {} to {}", local.display(), staged));
                call.session.upload(&local, &staged)?;
                let result = call.execute(ExecutionPayload::ScriptFile(staged.clone()));
                if let Err(err) = call.session.remove_file(&staged) {
                    call.status(&format!("Could not remove {}: {}", staged, err.message));
                }
                return Ok(StepReport::executed(result?));
            }
            ResolvedPath::InlineText(text) => ExecutionPayload::Command(text),
        };
        let result = call.execute(payload)?;
        Ok(StepReport::executed(result))
    }
}
