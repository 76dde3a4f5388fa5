use anyhow::{Context, bail};
use clap::{Args, Subcommand};

use super::CliContext;
use mg_bridge::{
    activity::ActivityEvent,
    config::BridgeConfig,
    connection::{Connection, ConnectionStore, JsonFileConnectionStore},
};

/// Edits the store file directly. A running bridge picks changes up on its
/// next activity event for the tenant, or on restart.
#[derive(Args, Debug)]
pub struct ConnectionArgs {
    #[command(subcommand)]
    pub command: ConnectionCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConnectionCommands {
    /// Print every stored connection
    List,
    /// Add a connection, or replace the one with the same client id
    Add {
        client_id: String,
        #[arg(long)]
        system_url: String,
        #[arg(long, default_value = "")]
        api_key: String,
        #[arg(long)]
        gate_url: String,
        #[arg(long)]
        gate_token: String,
        /// Store it switched off
        #[arg(long)]
        inactive: bool,
    },
    Remove { client_id: String },
}

pub async fn execute(args: ConnectionArgs, context: &CliContext) -> anyhow::Result<()> {
    let config = BridgeConfig::load(&context.config_manager, &context.root).await?;
    let store = JsonFileConnectionStore::open(&config.store_path)
        .await
        .with_context(|| format!("could not open {}", config.store_path.display()))?;

    match args.command {
        ConnectionCommands::List => {
            let connections = store.list().await?;
            if connections.is_empty() {
                println!("No connections in {}", store.path().display());
            }
            for c in connections {
                println!(
                    "{:>4}  {:<32}  {:<8}  {}  (gateway {})",
                    c.id,
                    c.client_id,
                    if c.active { "active" } else { "inactive" },
                    c.system_url,
                    c.gate_url
                );
            }
        }
        ConnectionCommands::Add {
            client_id,
            system_url,
            api_key,
            gate_url,
            gate_token,
            inactive,
        } => {
            ActivityEvent::new(client_id.as_str(), !inactive, false, system_url.as_str()).validate()?;
            if gate_token.trim().is_empty() {
                bail!("--gate-token must not be empty");
            }
            let saved = store
                .upsert(
                    Connection::new(client_id, system_url)
                        .with_api_key(api_key)
                        .with_gateway(gate_url, gate_token)
                        .activated(!inactive),
                )
                .await?;
            println!("✅ Connection `{}` saved with id {}.", saved.client_id, saved.id);
        }
        ConnectionCommands::Remove { client_id } => {
            if store.remove(&client_id).await? {
                println!("✅ Connection `{client_id}` removed.");
            } else {
                println!("No connection `{client_id}` to remove.");
            }
        }
    }
    Ok(())
}
