use crate::context::FlowIdentity;
use crate::logger::{LogConfig, LogLevel};
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, time::Duration};
use tracing::{debug, warn};

pub const SERVER_ID_KEY: &str = "FLOWCTX_SERVER_ID";
pub const AWAIT_TIMEOUT_KEY: &str = "FLOWCTX_AWAIT_TIMEOUT_MS";
pub const LOG_LEVEL_KEY: &str = "FLOWCTX_LOG_LEVEL";
pub const LOG_DIR_KEY: &str = "FLOWCTX_LOG_DIR";

pub const DEFAULT_SERVER_ID: &str = "local";
pub const DEFAULT_AWAIT_TIMEOUT: Duration = Duration::from_millis(5_000);

#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    async fn del(&self, key: &str);
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

/// Reads configuration from the process environment, after loading an optional `.env`.
///
/// Values written through [`ConfigManagerType::set`] are kept as in-process overrides and
/// never touch the real environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
    #[serde(skip)]
    overrides: DashMap<String, String>,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => debug!("Loaded .env from {}", env_file.display()),
                Err(err) => warn!("could not load .env from {}: {err}", env_file.display()),
            }
        } else {
            debug!("no .env at {}, using the process environment", env_file.display());
        }

        Box::new(Self {
            env_file,
            overrides: DashMap::new(),
        })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = env::vars().map(|(k, _)| k).collect();
        for entry in self.overrides.iter() {
            if !keys.contains(entry.key()) {
                keys.push(entry.key().clone());
            }
        }
        keys
    }

    async fn get(&self, key: &str) -> Option<String> {
        match self.overrides.get(key) {
            Some(value) => Some(value.clone()),
            None => env::var(key).ok(),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.overrides.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.overrides.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with_values<I, K, V>(values: I) -> Box<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = DashMap::new();
        for (k, v) in values {
            map.insert(k.into(), v.into());
        }
        Box::new(Self { map })
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

/// Settings shared by the code that creates and awaits event contexts.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Stamped on every flow identity created through [`RuntimeConfig::flow`].
    pub server_id: String,
    /// Default bound for callers blocking on a response or completion signal.
    pub await_timeout: Duration,
    pub log: LogConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server_id: DEFAULT_SERVER_ID.to_string(),
            await_timeout: DEFAULT_AWAIT_TIMEOUT,
            log: LogConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub async fn load(manager: &ConfigManager) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(server_id) = manager.0.get(SERVER_ID_KEY).await {
            config.server_id = server_id;
        }

        if let Some(raw) = manager.0.get(AWAIT_TIMEOUT_KEY).await {
            let millis: u64 = raw.trim().parse().with_context(|| {
                format!("{AWAIT_TIMEOUT_KEY} must be a number of milliseconds, got '{raw}'")
            })?;
            config.await_timeout = Duration::from_millis(millis);
        }

        if let Some(raw) = manager.0.get(LOG_LEVEL_KEY).await {
            let level: LogLevel = raw
                .parse()
                .with_context(|| format!("invalid {LOG_LEVEL_KEY}"))?;
            config.log = config.log.with_level(level);
        }

        if let Some(dir) = manager.0.get(LOG_DIR_KEY).await {
            config.log = config.log.with_dir(PathBuf::from(dir));
        }

        debug!(?config, "runtime configuration loaded");
        Ok(config)
    }

    pub fn flow(&self, name: &str) -> FlowIdentity {
        FlowIdentity::new(name, self.server_id.clone())
    }
}
