use clap::{Args, Subcommand};

use super::CliContext;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Set a key in `config/.env`, e.g. `BRIDGE_STOP_TIMEOUT_MS 2000`
    Set { key: String, value: String },
    Get { key: String },
    Delete { key: String },
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        ConfigCommands::Set { key, value } => {
            match context.config_manager.0.set(&key, &value).await {
                Ok(_) => println!("✅ Config {key} set."),
                Err(err) => eprintln!("❌ Config {key} could not be set: {err}"),
            }
        }
        ConfigCommands::Get { key } => match context.config_manager.0.get(&key).await {
            Some(value) => println!("{key}={value}"),
            None => println!("{key} is not set"),
        },
        ConfigCommands::Delete { key } => {
            context.config_manager.0.del(&key).await;
            println!("✅ Config {key} deleted.");
        }
    }
    Ok(())
}
