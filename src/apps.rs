use std::{fs, future::Future, path::Path, sync::Arc};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::{
    config::{BridgeConfig, ConfigManager, HTTP_ADDR_KEY, STOP_TIMEOUT_KEY, STORE_PATH_KEY},
    connection::JsonFileConnectionStore,
    manager::{BootstrapReport, WorkerManager},
    server,
    worker::GatewayRelayFactory,
};

/// A running bridge: the worker manager plus the settings it was built from.
pub struct App {
    config: BridgeConfig,
    manager: Arc<WorkerManager>,
}

impl App {
    /// Resolve settings, open the connection store and start a worker for
    /// every active connection.
    ///
    /// Individual tenants failing to start does not fail the bootstrap.
    pub async fn bootstrap(root: &Path, config_manager: &ConfigManager) -> Result<(Self, BootstrapReport)> {
        let config = BridgeConfig::load(config_manager, root).await?;
        info!(
            store = %config.store_path.display(),
            addr = %config.http_addr,
            "Bootstrapping bridge"
        );

        let store = JsonFileConnectionStore::open(&config.store_path)
            .await
            .with_context(|| format!("could not open connection store {}", config.store_path.display()))?;
        let relays = GatewayRelayFactory::new(config.reconnect_delay);
        let manager = WorkerManager::new(Arc::new(store), Arc::new(relays), config.worker_timeouts);

        let report = manager.bootstrap().await?;
        for (client_id, reason) in &report.failed {
            warn!(client_id = %client_id, "Not running after bootstrap: {reason}");
        }

        Ok((Self { config, manager }, report))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn manager(&self) -> Arc<WorkerManager> {
        self.manager.clone()
    }

    /// Accept activity events until `shutdown` resolves.
    pub async fn serve<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        server::serve(self.config.http_addr, self.manager.clone(), shutdown).await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        info!("All workers stopped");
    }
}

/// Called when user runs `mg-bridge init`
pub async fn cmd_init(root: &Path, config_manager: &ConfigManager) -> Result<()> {
    for dir in ["config", "logs"] {
        let path = root.join(dir);
        fs::create_dir_all(&path).with_context(|| format!("failed to create {}", path.display()))?;
    }

    let conf_path = root.join("config/.env");
    if !conf_path.exists() {
        let default_cfg = format!(
            "{HTTP_ADDR_KEY}={}\n{STORE_PATH_KEY}={}\n{STOP_TIMEOUT_KEY}=5000\n",
            BridgeConfig::DEFAULT_HTTP_ADDR,
            BridgeConfig::DEFAULT_STORE_FILE,
        );
        fs::write(&conf_path, default_cfg).with_context(|| format!("failed to write {}", conf_path.display()))?;
        println!("Created {}", conf_path.display());
    } else {
        println!("Skipping {}, already exists", conf_path.display());
    }

    let config = BridgeConfig::load(config_manager, root).await?;
    let store_path = &config.store_path;
    if store_path.exists() {
        // refuse to go on with a store we could not run on
        if let Err(err) = JsonFileConnectionStore::open(store_path).await {
            error!("Existing store {} is unreadable: {err}", store_path.display());
            return Err(err).with_context(|| format!("unreadable store {}", store_path.display()));
        }
        println!("Skipping {}, already exists", store_path.display());
    } else {
        if let Some(parent) = store_path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(store_path, "[]\n").with_context(|| format!("failed to write {}", store_path.display()))?;
        println!("Created {}", store_path.display());
    }

    Ok(())
}
