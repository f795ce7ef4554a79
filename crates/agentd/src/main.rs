//! agentd: the agentgrid admin daemon.
//!
//! Assembles the agentgrid subsystems for one host:
//! - State store (redb)
//! - Port allocator, hydrated from the ledger
//! - Workload renderer and docker compose runtime
//! - Bot-token validation behind a circuit breaker
//! - Optional Caddy registration
//!
//! # Usage
//!
//! ```text
//! agentd init
//! agentd create-tenant --email ada@example.com --name Ada --bot-token 123:abc
//! agentd provision ada-example-com
//! ```

mod app;

use std::path::{Path, PathBuf};

use agentgrid_core::GridConfig;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;

use crate::app::{App, NewTenant};

const DEFAULT_CONFIG_FILE: &str = "agentgrid.toml";
const DEFAULT_LOG_FILTER: &str = "info,agentd=debug,agentgrid=debug";

#[derive(Parser)]
#[command(name = "agentd", about = "agentgrid tenant provisioning daemon")]
struct Cli {
    /// Config file (defaults to ./agentgrid.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for persistent state; overrides the config file.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Create the state store and seed the catalog.
    Init,

    /// Register a new pending tenant.
    CreateTenant {
        #[arg(long)]
        email: String,

        /// Assistant display name.
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        instructions: String,

        #[arg(long)]
        bot_token: String,

        #[arg(long, default_value = agentgrid_core::DEFAULT_AGENT_TYPE)]
        agent_type: String,

        #[arg(long, default_value = agentgrid_core::DEFAULT_LLM_PROVIDER)]
        llm_provider: String,

        /// Do not check the bot token with Telegram.
        #[arg(long)]
        skip_validation: bool,
    },

    /// Provision a pending tenant. Ctrl-C cancels and rolls back.
    Provision { tenant_id: String },

    /// Stop an active tenant's container.
    Suspend { tenant_id: String },

    /// Restart a suspended tenant's container.
    Resume { tenant_id: String },

    /// Release a tenant's resources and mark it cancelled.
    Terminate { tenant_id: String },

    /// Show a tenant record and its container state.
    Status { tenant_id: String },

    /// Check a bot token through the validation breaker.
    ValidateToken { token: String },

    /// List the port ledger.
    Ports,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(cli.config.as_deref(), cli.data_dir)?;
    let app = App::open(config)?;

    match cli.command {
        Command::Init => app.init(),
        Command::CreateTenant {
            email,
            name,
            instructions,
            bot_token,
            agent_type,
            llm_provider,
            skip_validation,
        } => {
            app.create_tenant(NewTenant {
                email,
                assistant_name: name,
                instructions,
                bot_token,
                agent_type,
                llm_provider,
                validate: !skip_validation,
            })
            .await
        }
        Command::Provision { tenant_id } => app.provision(&tenant_id).await,
        Command::Suspend { tenant_id } => app.suspend(&tenant_id).await,
        Command::Resume { tenant_id } => app.resume(&tenant_id).await,
        Command::Terminate { tenant_id } => app.terminate(&tenant_id).await,
        Command::Status { tenant_id } => app.status(&tenant_id).await,
        Command::ValidateToken { token } => app.validate_token(&token).await,
        Command::Ports => app.ports(),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// File (explicit, or `./agentgrid.toml` if present), then environment,
/// then command-line overrides.
fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<GridConfig> {
    let mut config = match path {
        Some(path) => GridConfig::from_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            GridConfig::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        }
        None => GridConfig::default(),
    };
    config.apply_env()?;
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    config.validate()?;
    debug!(data_dir = %config.data_dir.display(), "configuration loaded");
    Ok(config)
}
