use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::worker::WorkerTimeouts;

pub const HTTP_ADDR_KEY: &str = "BRIDGE_HTTP_ADDR";
pub const STORE_PATH_KEY: &str = "BRIDGE_STORE_PATH";
pub const START_TIMEOUT_KEY: &str = "BRIDGE_START_TIMEOUT_MS";
pub const STOP_TIMEOUT_KEY: &str = "BRIDGE_STOP_TIMEOUT_MS";
pub const RECONNECT_DELAY_KEY: &str = "BRIDGE_RECONNECT_DELAY_MS";

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from (and written back to) a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(err) => warn!("could not parse {}: {}", env_file.display(), err),
            }
        } else {
            info!("no .env at {}, using the process environment", env_file.display())
        }

        Box::new(Self { env_file })
    }

    fn rewrite_env_file(&self, key: &str, value: Option<&str>) -> Result<(), String> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = Vec::new();
        let mut found = false;

        for line in content.lines() {
            match line.split_once('=') {
                Some((k, _)) if k.trim() == key => {
                    found = true;
                    if let Some(v) = value {
                        lines.push(format!("{key}={v}"));
                    }
                }
                _ => lines.push(line.to_string()),
            }
        }
        if let (false, Some(v)) = (found, value) {
            lines.push(format!("{key}={v}"));
        }

        fs::write(&self.env_file, lines.join("\n")).map_err(|e| e.to_string())
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite_env_file(key, Some(value))
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            let _ = self.rewrite_env_file(key, None);
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config `{key}` has invalid value `{value}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings of a running bridge, resolved from a [`ConfigManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub http_addr: SocketAddr,
    pub store_path: PathBuf,
    pub worker_timeouts: WorkerTimeouts,
    pub reconnect_delay: Duration,
}

impl BridgeConfig {
    pub const DEFAULT_HTTP_ADDR: &'static str = "0.0.0.0:3001";
    pub const DEFAULT_STORE_FILE: &'static str = "connections.json";

    /// Relative store paths are resolved against `root`.
    pub async fn load(config: &ConfigManager, root: &Path) -> Result<Self, ConfigError> {
        let raw_addr = config
            .0
            .get(HTTP_ADDR_KEY)
            .await
            .unwrap_or_else(|| Self::DEFAULT_HTTP_ADDR.to_string());
        let http_addr = raw_addr
            .trim()
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                key: HTTP_ADDR_KEY,
                value: raw_addr.clone(),
                reason: e.to_string(),
            })?;

        let store_path = match config.0.get(STORE_PATH_KEY).await {
            Some(raw) if !raw.trim().is_empty() => PathBuf::from(raw.trim()),
            _ => PathBuf::from(Self::DEFAULT_STORE_FILE),
        };
        let store_path = if store_path.is_relative() {
            root.join(store_path)
        } else {
            store_path
        };

        let defaults = WorkerTimeouts::default();
        let worker_timeouts = WorkerTimeouts {
            start: millis(config, START_TIMEOUT_KEY, defaults.start).await?,
            stop: millis(config, STOP_TIMEOUT_KEY, defaults.stop).await?,
        };
        let reconnect_delay = millis(config, RECONNECT_DELAY_KEY, Duration::from_secs(2)).await?;

        Ok(Self {
            http_addr,
            store_path,
            worker_timeouts,
            reconnect_delay,
        })
    }
}

async fn millis(config: &ConfigManager, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let Some(raw) = config.0.get(key).await else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(e) => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
