use crate::broker::DEFAULT_MAILBOX_CAPACITY;
use crate::maintenance::{MaintenanceSettings, SHUTDOWN_SAVE_ATTEMPTS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const CONFIG_ENV: &str = "ALIVE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "alive.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AliveConfig {
    pub data_path: PathBuf,
    pub listen: String,
    pub debug: bool,
    pub mailbox_capacity: usize,
    pub keepalive_secs: u64,
    pub maintenance_interval_secs: u64,
    pub save_interval_secs: u64,
    pub shutdown_save_attempts: u32,
}

impl Default for AliveConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            listen: "0.0.0.0:8081".into(),
            debug: false,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            keepalive_secs: 3,
            maintenance_interval_secs: 1,
            save_interval_secs: 60,
            shutdown_save_attempts: SHUTDOWN_SAVE_ATTEMPTS,
        }
    }
}

fn default_data_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".alive").join("data"),
        None => PathBuf::from(".alive").join("data"),
    }
}

impl AliveConfig {
    /// Surcharges ALIVE_DATA_PATH / ALIVE_LISTEN / ALIVE_DEBUG
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("ALIVE_DATA_PATH").filter(|v| !v.trim().is_empty()) {
            self.data_path = PathBuf::from(path);
        }
        if let Some(listen) = lookup("ALIVE_LISTEN").filter(|v| !v.trim().is_empty()) {
            self.listen = listen;
        }
        if let Some(debug) = lookup("ALIVE_DEBUG") {
            self.debug = matches!(debug.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }

    // tokio refuse une période ou une capacité nulle : plancher à 1
    pub fn mailbox_capacity(&self) -> usize {
        self.mailbox_capacity.max(1)
    }

    pub fn keepalive_every(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn maintenance(&self) -> MaintenanceSettings {
        MaintenanceSettings {
            interval: Duration::from_secs(self.maintenance_interval_secs.max(1)),
            save_every: Duration::from_secs(self.save_interval_secs),
            shutdown_save_attempts: self.shutdown_save_attempts.max(1),
        }
    }
}

pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Fichier absent ou vide => config par défaut ; fichier illisible ou invalide => erreur
/// (l'appelant décide de retomber sur les défauts).
pub async fn load_config_from(path: &Path) -> Result<AliveConfig, ConfigError> {
    if !path.exists() {
        return Ok(AliveConfig::default());
    }
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if txt.trim().is_empty() {
        return Ok(AliveConfig::default());
    }
    serde_yaml::from_str(&txt).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Charge la config depuis `$ALIVE_CONFIG` (défaut `alive.yaml`) puis applique l'environnement.
/// En cas de fichier invalide, renvoie les défauts + l'erreur à logger.
pub async fn load_config() -> (AliveConfig, Option<ConfigError>) {
    let (mut cfg, problem) = match load_config_from(&config_path()).await {
        Ok(cfg) => (cfg, None),
        Err(e) => (AliveConfig::default(), Some(e)),
    };
    cfg.apply_overrides(|key| std::env::var(key).ok());
    (cfg, problem)
}
