mod cli;

use std::{env, path::PathBuf};

use clap::Parser;
use cli::{Cli, CliContext, default_command};
use mg_bridge::config::{ConfigManager, EnvConfigManager};

/// Resolve the bridge root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    if let Ok(path) = env::var("MG_BRIDGE_ROOT") {
        PathBuf::from(path)
    } else {
        PathBuf::from("./mg-bridge")
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // wss gateways; fails only if a provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();
    let root = resolve_root_dir();
    let config_manager = ConfigManager(EnvConfigManager::new(root.join("config/.env")));
    let context = CliContext::new(root, config_manager);

    cli::execute(&context, cli.command.unwrap_or_else(default_command)).await
}
