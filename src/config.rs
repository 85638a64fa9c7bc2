//! Gateway configuration, read from a JSON file.
//!
//! Every field has a default, so `{}` is a valid configuration.

use crate::ecr::catalog::ErrorPolicy;
use crate::ecr::device::{DeviceOptions, DeviceRecord};
use crate::ecr::device_manager::DeviceRegistry;
use crate::ecr::error::{EcrError, Result};
use crate::ecr::lock::LockPolicy;
use crate::ecr::retry::RetryPolicy;
use crate::ecr::store::{DeviceStore, MemoryStore, SqliteStore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// A holder older than this is evicted.
    pub max_busy_secs: u64,
    pub acquire_attempts: u32,
    pub acquire_interval_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            max_busy_secs: 60,
            acquire_attempts: 10,
            acquire_interval_ms: 1000,
        }
    }
}

impl LockSettings {
    pub fn policy(&self) -> LockPolicy {
        LockPolicy {
            max_busy: Duration::from_secs(self.max_busy_secs),
            retry: RetryPolicy::fixed(
                self.acquire_attempts,
                Duration::from_millis(self.acquire_interval_ms),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SQLite file for device records; in-memory store when unset.
    pub database_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    /// Decimal places of the currency's minor unit.
    pub money_digits: u32,
    pub lock: LockSettings,
    pub error_rules: ErrorPolicy,
    /// Seed records, registered on start-up unless already stored.
    pub devices: Vec<DeviceRecord>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_dir: None,
            money_digits: 2,
            lock: LockSettings::default(),
            error_rules: ErrorPolicy::default(),
            devices: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| EcrError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_json::from_str(text).map_err(|e| EcrError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.money_digits > 4 {
            return Err(EcrError::Config(format!(
                "money_digits {} outside 0..=4",
                self.money_digits
            )));
        }
        if self.lock.acquire_attempts == 0 {
            return Err(EcrError::Config("lock.acquire_attempts must be positive".into()));
        }
        for record in &self.devices {
            record.validate()?;
        }
        Ok(())
    }

    pub fn device_options(&self) -> DeviceOptions {
        DeviceOptions::new(self.lock.policy(), self.money_digits, self.error_rules.clone())
    }

    pub fn open_store(&self) -> Result<Arc<dyn DeviceStore>> {
        Ok(match &self.database_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        })
    }

    /// Registry loaded from the store, with seed devices added on top.
    pub fn open_registry(&self) -> Result<DeviceRegistry> {
        let registry = DeviceRegistry::new(self.open_store()?, self.device_options());
        registry.load_all()?;
        self.seed(&registry)?;
        Ok(registry)
    }

    pub(crate) fn seed(&self, registry: &DeviceRegistry) -> Result<usize> {
        let mut added = 0;
        for record in &self.devices {
            if !registry.contains(&record.device_id) {
                registry.register(record.clone())?;
                added += 1;
            }
        }
        if added > 0 {
            info!("Registered {added} devices from configuration");
        }
        Ok(added)
    }
}
