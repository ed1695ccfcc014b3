mod command;
mod get;
mod put;
mod remove;
mod script;

pub use command::CommandStep;
pub use get::GetStep;
pub use put::PutStep;
pub use remove::RemoveStep;
pub use script::ScriptStep;

use crate::config::EngineConfig;
use crate::errors::{StepError, StepErrorKind};
use crate::services::context::StepContext;
use crate::services::credentials::CredentialResolver;
use crate::services::log_sink::{LogSink, StreamKind};
use crate::services::logger::Logger;
use crate::services::validation::Validation;
use crate::ssh::executor::{
    CommandExecutor, ExecutionIo, ExecutionPayload, ExecutionRequest, ExecutionResult, Sudo,
};
use crate::ssh::factory::SessionFactory;
use crate::ssh::fs::join_remote;
use crate::ssh::resolver::{RemotePathResolver, ResolvedPath};
use crate::ssh::session::TransportSession;
use crate::ssh::target::{read_positive_int, RemoteTarget};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Options shared by every step type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOptions {
    pub working_dir: Option<String>,
    pub timeout_ms: Option<u64>,
    pub ignore_exit_status: bool,
    pub sudo: bool,
    pub pty: bool,
    pub dry_run: bool,
    /// Prefix every streamed line with `<remote name>|`.
    pub append_name: bool,
    pub verbose: bool,
    pub env: BTreeMap<String, String>,
    /// Names copied from the job environment into the remote environment.
    pub env_passthrough: Vec<String>,
}

impl StepOptions {
    pub fn from_value(validation: &Validation, args: &Value) -> Result<Self, StepError> {
        let flag = |key: &str| args.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
        let working_dir = validation.ensure_optional_string(
            args.get("working_dir").or_else(|| args.get("dir")),
            "working_dir",
        )?;
        let env_passthrough = match args.get("env_passthrough") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(|s| s.to_string()).ok_or_else(|| {
                        StepError::validation("env_passthrough must be an array of strings")
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(StepError::validation(
                    "env_passthrough must be an array of strings",
                ))
            }
        };
        let options = Self {
            working_dir,
            timeout_ms: read_positive_int(args.get("timeout_ms")),
            ignore_exit_status: flag("ignore_exit_status"),
            sudo: flag("sudo"),
            pty: flag("pty"),
            dry_run: flag("dry_run"),
            append_name: flag("append_name"),
            verbose: flag("verbose"),
            env: validation.ensure_env(args.get("env"))?,
            env_passthrough,
        };
        options.validate(validation)?;
        Ok(options)
    }

    pub fn validate(&self, validation: &Validation) -> Result<(), StepError> {
        for name in self.env.keys().chain(self.env_passthrough.iter()) {
            validation.ensure_env_name(name)?;
        }
        Ok(())
    }

    /// Explicit overrides win over passthrough values.
    pub fn effective_env(&self, job_env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .env_passthrough
            .iter()
            .filter_map(|name| job_env.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    pub fn remote_path(&self, reference: &str) -> String {
        join_remote(self.working_dir.as_deref(), reference)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepStatus {
    Completed { exit_code: i32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub from: String,
    pub into: String,
    pub files: u64,
    pub bytes: u64,
}

/// What a strategy hands back to the runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub result: Option<ExecutionResult>,
    pub transfer: Option<TransferReport>,
}

impl StepReport {
    pub fn executed(result: ExecutionResult) -> Self {
        Self {
            result: Some(result),
            transfer: None,
        }
    }

    pub fn transferred(transfer: TransferReport) -> Self {
        Self {
            result: None,
            transfer: Some(transfer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: String,
    pub target: String,
    pub status: StepStatus,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferReport>,
    pub duration_ms: u64,
}

impl StepOutcome {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            StepStatus::Completed { exit_code } => exit_code,
        }
    }
}

/// One step type: its local checks, what it resolves against the remote side,
/// and how it runs once a session is open.
pub trait StepStrategy: Send + 'static {
    type Plan;

    fn name(&self) -> &'static str;

    /// Local checks only. Runs before any session is requested.
    fn validate(&self, validation: &Validation, ctx: &StepContext) -> Result<(), StepError>;

    /// One-line summary for status lines and dry runs.
    fn describe(&self) -> String;

    fn resolve(&self, call: &mut StepCall<'_>) -> Result<Self::Plan, StepError>;

    fn run(&self, call: &mut StepCall<'_>, plan: Self::Plan) -> Result<StepReport, StepError>;
}

/// Everything a strategy may touch while its session is open.
pub struct StepCall<'a> {
    pub session: &'a mut dyn TransportSession,
    pub executor: &'a dyn CommandExecutor,
    pub resolver: &'a RemotePathResolver,
    pub options: &'a StepOptions,
    pub ctx: &'a StepContext,
    pub io: &'a ExecutionIo,
    pub env: &'a BTreeMap<String, String>,
    pub sudo: Option<Sudo>,
    pub timeout: Option<Duration>,
}

impl StepCall<'_> {
    pub fn execute(&mut self, payload: ExecutionPayload) -> Result<ExecutionResult, StepError> {
        let request = ExecutionRequest {
            payload,
            working_dir: self.options.working_dir.clone(),
            env: self.env.clone(),
            timeout: self.timeout,
            sudo: self.sudo.clone(),
            pty: self.options.pty,
        };
        self.executor.execute(&mut *self.session, &request, self.io)
    }

    /// Looks the reference up in the job workspace when there is one, the remote host otherwise.
    pub fn resolve_reference(&mut self, reference: &str) -> Result<ResolvedPath, StepError> {
        match self.ctx.workspace.as_ref() {
            Some(workspace) => self.resolver.resolve_in_workspace(&**workspace, reference),
            None => self.resolver.resolve(
                &*self.session,
                reference,
                self.options.working_dir.as_deref(),
            ),
        }
    }

    pub fn ensure_not_cancelled(&self) -> Result<(), StepError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(StepError::cancelled("Step cancelled"));
        }
        Ok(())
    }

    pub fn status(&self, line: &str) {
        self.io.status(line);
    }
}

pub(crate) fn remote_missing(path: &str) -> StepError {
    StepError::new(
        StepErrorKind::Execution,
        "REMOTE_NOT_FOUND",
        format!("{} does not exist on the remote host.", path),
    )
}

/// Owns a session for the length of one step and releases it on every path.
pub struct SessionGuard {
    session: Box<dyn TransportSession>,
    log: Arc<dyn LogSink>,
    logger: Logger,
    opened: Instant,
    released: bool,
}

impl SessionGuard {
    pub fn new(session: Box<dyn TransportSession>, log: Arc<dyn LogSink>, logger: Logger) -> Self {
        Self {
            session,
            log,
            logger,
            opened: Instant::now(),
            released: false,
        }
    }

    pub fn session(&mut self) -> &mut dyn TransportSession {
        self.session.as_mut()
    }

    /// Closes after success, aborts after failure.
    pub fn release(&mut self, succeeded: bool) {
        if self.released {
            return;
        }
        self.released = true;
        if succeeded {
            if let Err(err) = self.session.close() {
                self.logger.warn(
                    "session close failed",
                    Some(&serde_json::json!({ "error": err.message })),
                );
            }
        } else {
            self.session.abort();
        }
        self.log_timing();
    }

    fn log_timing(&self) {
        self.log.line(
            StreamKind::Status,
            &format!(
                "Session to {} closed after {}ms",
                self.session.target().display_name(),
                self.opened.elapsed().as_millis()
            ),
        );
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.session.close();
            self.log_timing();
        }
    }
}

/// The shared validate, acquire, resolve, execute, release, report template.
#[derive(Clone)]
pub struct StepRunner {
    factory: Arc<dyn SessionFactory>,
    credentials: Arc<dyn CredentialResolver>,
    executor: Arc<dyn CommandExecutor>,
    resolver: RemotePathResolver,
    validation: Validation,
    logger: Logger,
    config: EngineConfig,
}

impl StepRunner {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        credentials: Arc<dyn CredentialResolver>,
        executor: Arc<dyn CommandExecutor>,
        logger: Logger,
        config: EngineConfig,
    ) -> Self {
        let logger = logger.child("steps");
        Self {
            factory,
            credentials,
            executor,
            resolver: RemotePathResolver::new(logger.clone()),
            validation: Validation::new(),
            logger,
            config,
        }
    }

    pub fn validation(&self) -> &Validation {
        &self.validation
    }

    pub async fn run<S: StepStrategy>(
        &self,
        step: S,
        target: &RemoteTarget,
        options: &StepOptions,
        ctx: &StepContext,
    ) -> Result<StepOutcome, StepError> {
        let started = Instant::now();
        let name = step.name();
        step.validate(&self.validation, ctx)?;
        target.validate(&self.validation)?;
        options.validate(&self.validation)?;

        let summary = step.describe();
        if options.dry_run {
            ctx.log.line(
                StreamKind::Status,
                &format!(
                    "[dry run] {} on {}: {}",
                    name,
                    target.display_name(),
                    summary
                ),
            );
            return Ok(StepOutcome {
                step: name.to_string(),
                target: target.display_name(),
                status: StepStatus::Completed { exit_code: 0 },
                dry_run: true,
                result: None,
                transfer: None,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let sudo = if options.sudo {
            let credential = self.credentials.resolve(&target.credential_id)?;
            Some(Sudo::new(credential.sudo_password().map(str::to_string)))
        } else {
            None
        };
        let timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .or_else(|| self.config.exec_default_timeout());
        let io = ExecutionIo::new(Arc::clone(&ctx.log))
            .with_prefix(options.append_name.then(|| format!("{}|", target.name)));
        io.status(&format!(
            "Executing {} on {} from {}: {}",
            name,
            target.display_name(),
            ctx.launcher.label(),
            summary
        ));
        self.logger.info(
            "step started",
            Some(&serde_json::json!({
                "step": name,
                "run": ctx.run,
                "remote": target.name,
            })),
        );

        // A job abort, or this future being dropped, cancels the step.
        let step_cancel = ctx.cancel.child_token();
        let _cancel_on_drop = step_cancel.clone().drop_guard();
        let runtime = tokio::runtime::Handle::current();
        let factory = Arc::clone(&self.factory);
        let credentials = Arc::clone(&self.credentials);
        let executor = Arc::clone(&self.executor);
        let resolver = self.resolver.clone();
        let logger = self.logger.child(name);
        let target_owned = target.clone();
        let options_owned = options.clone();
        let ctx_owned = ctx.clone().with_cancel(step_cancel.clone());
        let io = io.with_cancel(step_cancel.clone());
        let env = options.effective_env(&ctx.env);

        let report = tokio::task::spawn_blocking(move || -> Result<StepReport, StepError> {
            let session = factory.create(
                &target_owned,
                options_owned.verbose,
                target_owned.strict_host_key_checking(),
                credentials.as_ref(),
            )?;
            let mut guard = SessionGuard::new(session, Arc::clone(&ctx_owned.log), logger);
            let finished = CancellationToken::new();
            if let Some(interrupt) = guard.session().interrupt_handle() {
                let cancel = step_cancel.clone();
                let finished = finished.clone();
                runtime.spawn(async move {
                    tokio::select! {
                        biased;
                        _ = finished.cancelled() => {}
                        _ = cancel.cancelled() => interrupt.interrupt(),
                    }
                });
            }
            let outcome = if step_cancel.is_cancelled() {
                Err(StepError::cancelled("Step cancelled"))
            } else {
                let mut call = StepCall {
                    session: guard.session(),
                    executor: executor.as_ref(),
                    resolver: &resolver,
                    options: &options_owned,
                    ctx: &ctx_owned,
                    io: &io,
                    env: &env,
                    sudo,
                    timeout,
                };
                step.resolve(&mut call)
                    .and_then(|plan| step.run(&mut call, plan))
            };
            finished.cancel();
            // An interrupted connection fails whatever call was in flight.
            let outcome = match outcome {
                Err(err) if step_cancel.is_cancelled() && err.kind != StepErrorKind::Cancelled => {
                    Err(StepError::cancelled(format!("Step cancelled: {}", err.message)))
                }
                other => other,
            };
            // Timed-out channels may still be open on the remote side.
            let healthy = match &outcome {
                Ok(report) => !report.result.as_ref().is_some_and(|r| r.timed_out),
                Err(_) => false,
            };
            guard.release(healthy && !step_cancel.is_cancelled());
            outcome
        })
        .await
        .map_err(|_| StepError::internal("SSH step task failed"))?;

        let report = match report {
            Ok(report) => report,
            Err(err) => {
                self.logger.warn(
                    "step failed",
                    Some(&serde_json::json!({
                        "step": name,
                        "code": err.code,
                        "message": err.message,
                    })),
                );
                return Err(err);
            }
        };

        let exit_code = match report.result.as_ref() {
            Some(result) => self.judge(name, result, options, ctx)?,
            None => 0,
        };
        Ok(StepOutcome {
            step: name.to_string(),
            target: target.display_name(),
            status: StepStatus::Completed { exit_code },
            dry_run: false,
            result: report.result,
            transfer: report.transfer,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Turns a finished execution into the step's exit code, or its failure.
    fn judge(
        &self,
        name: &str,
        result: &ExecutionResult,
        options: &StepOptions,
        ctx: &StepContext,
    ) -> Result<i32, StepError> {
        if result.timed_out {
            ctx.log.line(
                StreamKind::Status,
                &format!("{} timed out after {}ms", name, result.duration_ms),
            );
            return Err(StepError::timeout(format!(
                "{} timed out after {}ms",
                name, result.duration_ms
            ))
            .with_details(serde_json::json!({
                "duration_ms": result.duration_ms,
                "hard_timed_out": result.hard_timed_out,
            })));
        }
        let (exit_code, reason) = match (result.exit_code, result.signal.as_deref()) {
            (Some(code), _) => (code, format!("exit status {}", code)),
            (None, Some(signal)) => (-1, format!("signal {}", signal)),
            (None, None) => (-1, "unknown exit status".to_string()),
        };
        ctx.log
            .line(StreamKind::Status, &format!("{} finished with {}", name, reason));
        if exit_code == 0 {
            return Ok(0);
        }
        if options.ignore_exit_status {
            ctx.log.line(
                StreamKind::Status,
                &format!("Ignoring {} of {}", reason, name),
            );
            return Ok(exit_code);
        }
        Err(StepError::execution(
            exit_code,
            format!("{} failed with {}", name, reason),
        ))
    }
}
