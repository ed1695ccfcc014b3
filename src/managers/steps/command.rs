use super::{StepCall, StepReport, StepStrategy};
use crate::constants::limits;
use crate::errors::StepError;
use crate::services::context::StepContext;
use crate::services::validation::Validation;
use crate::ssh::executor::ExecutionPayload;
use crate::utils::text::summarize_command;
use serde_json::Value;

/// Runs a command line as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    pub command: String,
}

impl CommandStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn from_value(args: &Value) -> Self {
        Self::new(args.get("command").and_then(|v| v.as_str()).unwrap_or(""))
    }
}

impl StepStrategy for CommandStep {
    type Plan = ();

    fn name(&self) -> &'static str {
        "command"
    }

    fn validate(&self, validation: &Validation, _ctx: &StepContext) -> Result<(), StepError> {
        validation.ensure_present(Some(&self.command), "command")?;
        Ok(())
    }

    fn describe(&self) -> String {
        summarize_command(&self.command, limits::COMMAND_SUBSTRING_LENGTH)
    }

    fn resolve(&self, _call: &mut StepCall<'_>) -> Result<(), StepError> {
        Ok(())
    }

    fn run(&self, call: &mut StepCall<'_>, _plan: ()) -> Result<StepReport, StepError> {
        let result = call.execute(ExecutionPayload::Command(self.command.clone()))?;
        Ok(StepReport::executed(result))
    }
}
