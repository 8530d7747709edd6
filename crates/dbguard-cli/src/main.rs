use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use dbguard_api::{logging, DbGuardApi, DbGuardConfig};
use dbguard_core::PolicyForm;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "dbguard")]
#[command(about = "MySQL security monitor")]
struct Cli {
    /// YAML config file; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    settings_db: Option<PathBuf>,

    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store the initial policy if none exists yet.
    Activate,
    Check(CheckArgs),
    /// Show the banner and the last scheduled result.
    Status,
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Run the periodic path: persist the result and send mail.
    #[arg(long, default_value_t = false)]
    scheduled: bool,
}

#[derive(Debug, Subcommand)]
enum PolicyCommand {
    Show,
    Set(PolicySetArgs),
}

#[derive(Debug, Args)]
struct PolicySetArgs {
    /// Allowed database names separated by commas or newlines. Keeps the
    /// stored list when omitted.
    #[arg(long)]
    allowed: Option<String>,
    #[arg(long)]
    email_notify: Option<bool>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<DbGuardConfig> {
    let mut config = DbGuardConfig::load_or_default(cli.config.as_deref())?;
    if let Some(settings_db) = &cli.settings_db {
        config.settings_db.clone_from(settings_db);
    }
    if let Some(database_url) = &cli.database_url {
        config.database_url.clone_from(database_url);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing()?;
    let config = load_config(&cli)?;
    let api = DbGuardApi::from_config(&config)?;

    match cli.command {
        Command::Activate => run_activate(&api).await,
        Command::Check(args) => run_check(&args, &api).await,
        Command::Status => run_status(&api),
        Command::Policy { command } => run_policy(command, &api),
    }
}

async fn run_activate(api: &DbGuardApi) -> Result<()> {
    let policy = api.activate().await.context("activation failed")?;
    emit_json(serde_json::json!({ "policy": policy }))
}

async fn run_check(args: &CheckArgs, api: &DbGuardApi) -> Result<()> {
    if args.scheduled {
        let run = api.run_scheduled().await.context("scheduled check failed")?;
        return emit_json(serde_json::json!({
            "mode": "scheduled",
            "run_id": run.run_id.to_string(),
            "result": run.result,
            "notification": run.notification
        }));
    }

    let result = api.run_on_demand().await.context("on-demand check failed")?;
    emit_json(serde_json::json!({
        "mode": "on_demand",
        "result": result
    }))
}

fn run_status(api: &DbGuardApi) -> Result<()> {
    let status = api.status()?;
    emit_json(serde_json::to_value(&status).context("failed to serialize status")?)
}

fn run_policy(command: PolicyCommand, api: &DbGuardApi) -> Result<()> {
    match command {
        PolicyCommand::Show => {
            let policy = api.policy()?;
            emit_json(serde_json::json!({ "policy": policy }))
        }
        PolicyCommand::Set(args) => {
            let stored = api.policy()?.map(|policy| PolicyForm::from_policy(&policy));
            let mut form = match (stored, args.allowed) {
                (Some(mut form), Some(allowed)) => {
                    form.allowed_databases = allowed;
                    form
                }
                (None, Some(allowed)) => {
                    PolicyForm { allowed_databases: allowed, email_notify_enabled: true }
                }
                (Some(form), None) => form,
                (None, None) => {
                    return Err(anyhow!("--allowed is required when no policy is stored yet"));
                }
            };
            if let Some(enabled) = args.email_notify {
                form.email_notify_enabled = enabled;
            }
            let policy = api.update_policy(form)?;
            emit_json(serde_json::json!({ "policy": policy }))
        }
    }
}
