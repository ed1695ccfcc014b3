use clap::{Args, Parser, Subcommand};
use serde_json::{json, Map, Value};
use sshsteps::app::App;
use sshsteps::errors::StepError;
use sshsteps::services::context::{Launcher, StepContext};
use std::collections::BTreeMap;

#[derive(Parser, Debug)]
#[command(name = "sshsteps", version, about = "Run pipeline steps on a remote host over SSH")]
struct Cli {
    /// Remote definition as JSON, or `@path` to a JSON file.
    #[arg(long)]
    remote: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    credential: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    allow_any_hosts: bool,
    #[command(flatten)]
    options: OptionArgs,
    #[command(subcommand)]
    step: StepCommand,
}

#[derive(Args, Debug)]
struct OptionArgs {
    #[arg(long = "dir")]
    working_dir: Option<String>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    ignore_exit_status: bool,
    #[arg(long)]
    sudo: bool,
    #[arg(long)]
    pty: bool,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    append_name: bool,
    #[arg(long)]
    verbose: bool,
    /// KEY=VALUE, repeatable.
    #[arg(long = "env")]
    env: Vec<String>,
    /// Job variable to forward, repeatable.
    #[arg(long = "pass-env")]
    env_passthrough: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum StepCommand {
    Command { command: String },
    Script { script: String },
    Put { from: String, into: String },
    Get {
        from: String,
        into: String,
        #[arg(long = "override")]
        override_existing: bool,
    },
    Remove { path: String },
}

impl StepCommand {
    fn name(&self) -> &'static str {
        match self {
            StepCommand::Command { .. } => "command",
            StepCommand::Script { .. } => "script",
            StepCommand::Put { .. } => "put",
            StepCommand::Get { .. } => "get",
            StepCommand::Remove { .. } => "remove",
        }
    }

    fn args(&self) -> Map<String, Value> {
        let value = match self {
            StepCommand::Command { command } => json!({ "command": command }),
            StepCommand::Script { script } => json!({ "script": script }),
            StepCommand::Put { from, into } => json!({ "from": from, "into": into }),
            StepCommand::Get {
                from,
                into,
                override_existing,
            } => json!({ "from": from, "into": into, "override_existing": override_existing }),
            StepCommand::Remove { path } => json!({ "path": path }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

fn remote_value(cli: &Cli) -> Result<Value, StepError> {
    if let Some(raw) = cli.remote.as_deref() {
        let text = match raw.strip_prefix('@') {
            Some(path) => std::fs::read_to_string(path)?,
            None => raw.to_string(),
        };
        return serde_json::from_str(&text)
            .map_err(|err| StepError::validation(format!("remote must be valid JSON: {}", err)));
    }
    Ok(json!({
        "name": cli.name,
        "host": cli.host,
        "user": cli.user,
        "port": cli.port,
        "credential_id": cli.credential,
        "allow_any_hosts": cli.allow_any_hosts,
    }))
}

fn step_args(cli: &Cli) -> Result<Value, StepError> {
    let mut args = cli.step.args();
    let opts = &cli.options;
    let mut env = Map::new();
    for pair in &opts.env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| StepError::validation(format!("env must be KEY=VALUE: {}", pair)))?;
        env.insert(key.to_string(), Value::String(value.to_string()));
    }
    args.insert("working_dir".to_string(), json!(opts.working_dir));
    args.insert("timeout_ms".to_string(), json!(opts.timeout_ms));
    args.insert("ignore_exit_status".to_string(), json!(opts.ignore_exit_status));
    args.insert("sudo".to_string(), json!(opts.sudo));
    args.insert("pty".to_string(), json!(opts.pty));
    args.insert("dry_run".to_string(), json!(opts.dry_run));
    args.insert("append_name".to_string(), json!(opts.append_name));
    args.insert("verbose".to_string(), json!(opts.verbose));
    args.insert("env".to_string(), Value::Object(env));
    args.insert("env_passthrough".to_string(), json!(opts.env_passthrough));
    Ok(Value::Object(args))
}

async fn run(cli: Cli, app: &App) -> Result<Value, StepError> {
    let target = app.target_from_value(&remote_value(&cli)?)?;
    let args = step_args(&cli)?;
    let launcher = std::env::var("NODE_NAME")
        .ok()
        .filter(|name| !name.is_empty() && name != "built-in")
        .map(Launcher::Agent)
        .unwrap_or(Launcher::Local);
    let ctx = StepContext::console(std::env::var("BUILD_TAG").unwrap_or_else(|_| "cli".to_string()))
        .with_env(std::env::vars().collect::<BTreeMap<_, _>>())
        .with_launcher(launcher);

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let outcome = app.handle_step(cli.step.name(), &target, &args, &ctx).await?;
    serde_json::to_value(outcome)
        .map_err(|err| StepError::internal(format!("Failed to render outcome: {}", err)))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let app = App::initialize();
    let result = run(cli, &app).await;
    app.shutdown();
    match result {
        Ok(outcome) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome).unwrap_or_else(|_| outcome.to_string())
            );
        }
        Err(err) => {
            let rendered = serde_json::to_string(&err).unwrap_or_else(|_| err.to_string());
            eprintln!("sshsteps: {}", rendered);
            std::process::exit(1);
        }
    }
}
