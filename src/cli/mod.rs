use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod config;
pub mod connection;
pub mod init;
pub mod run;

use config::ConfigArgs;
use connection::ConnectionArgs;
use run::RunArgs;

use mg_bridge::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "mg-bridge",
    about = "Keeps one messaging relay running per active CRM tenant",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the bridge
    Run(RunArgs),

    /// Initialize a fresh layout
    Init,

    /// Manage tenant connections
    Connection(ConnectionArgs),

    /// Handle configuration
    Config(ConfigArgs),
}

#[derive(Clone)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(root: PathBuf, config_manager: ConfigManager) -> Self {
        Self { root, config_manager }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Init => init::execute(context).await,
        Commands::Connection(args) => connection::execute(args, context).await,
        Commands::Config(args) => config::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}
