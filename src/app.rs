use crate::config::EngineConfig;
use crate::errors::StepError;
use crate::managers::steps::{
    CommandStep, GetStep, PutStep, RemoveStep, ScriptStep, StepOptions, StepOutcome, StepRunner,
};
use crate::services::context::StepContext;
use crate::services::credentials::{CredentialResolver, EnvCredentials};
use crate::services::logger::Logger;
use crate::ssh::executor::ChannelExecutor;
use crate::ssh::factory::{PooledSessionFactory, SessionFactory, Ssh2SessionFactory};
use crate::ssh::target::{read_positive_int, RemoteTarget};
use serde_json::Value;
use std::sync::Arc;

pub const STEP_NAMES: &[&str] = &["command", "script", "put", "get", "remove"];

pub struct App {
    pub logger: Logger,
    pub config: EngineConfig,
    pub runner: StepRunner,
    pool: Option<Arc<PooledSessionFactory>>,
}

impl App {
    pub fn initialize() -> Self {
        Self::with_credentials(EngineConfig::from_env(), Arc::new(EnvCredentials::default()))
    }

    pub fn with_credentials(
        config: EngineConfig,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Self {
        let logger = Logger::new("sshsteps");
        let direct: Arc<dyn SessionFactory> = Arc::new(Ssh2SessionFactory::new(logger.clone()));
        let pool = config
            .reuse_sessions
            .then(|| Arc::new(PooledSessionFactory::new(direct.clone(), logger.clone())));
        let factory: Arc<dyn SessionFactory> = match &pool {
            Some(pool) => pool.clone() as Arc<dyn SessionFactory>,
            None => direct,
        };
        let executor = Arc::new(ChannelExecutor::new(logger.clone(), &config));
        let runner = StepRunner::new(
            factory,
            credentials,
            executor,
            logger.clone(),
            config.clone(),
        );
        logger.debug(
            "initialized",
            Some(&serde_json::json!({
                "reuse_sessions": config.reuse_sessions,
                "connect_timeout_ms": config.connect_timeout_ms,
            })),
        );
        Self {
            logger,
            config,
            runner,
            pool,
        }
    }

    /// Parses a remote definition, filling the connect timeout from engine config when absent.
    pub fn target_from_value(&self, value: &Value) -> Result<RemoteTarget, StepError> {
        let mut target = RemoteTarget::from_value(self.runner.validation(), value)?;
        if read_positive_int(value.get("connect_timeout_ms")).is_none() {
            target.connect_timeout_ms = self.config.connect_timeout_ms;
        }
        Ok(target)
    }

    /// Runs the named step with arguments shaped like the step's JSON input.
    pub async fn handle_step(
        &self,
        step: &str,
        target: &RemoteTarget,
        args: &Value,
        ctx: &StepContext,
    ) -> Result<StepOutcome, StepError> {
        let options = StepOptions::from_value(self.runner.validation(), args)?;
        match step {
            "command" => {
                self.runner
                    .run(CommandStep::from_value(args), target, &options, ctx)
                    .await
            }
            "script" => {
                self.runner
                    .run(ScriptStep::from_value(args), target, &options, ctx)
                    .await
            }
            "put" => {
                self.runner
                    .run(PutStep::from_value(args), target, &options, ctx)
                    .await
            }
            "get" => {
                self.runner
                    .run(GetStep::from_value(args), target, &options, ctx)
                    .await
            }
            "remove" => {
                self.runner
                    .run(RemoveStep::from_value(args), target, &options, ctx)
                    .await
            }
            other => Err(StepError::validation(format!("unknown step: {}", other))
                .with_hint(format!("Expected one of: {}", STEP_NAMES.join(", ")))),
        }
    }

    pub fn shutdown(&self) {
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
    }
}
