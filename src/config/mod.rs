pub mod printer_config;
pub mod printer_id;

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

use crate::config::{printer_config::PrinterConfigBambu, printer_id::PrinterId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// no message for this long means the printer needs a full refresh
    pub timeout_secs: u64,
    pub interval_ms: u64,
    pub reconnect_delay_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            interval_ms: 500,
            reconnect_delay_ms: 2000,
        }
    }
}

impl WatchdogConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    log_dir: Option<PathBuf>,
    #[serde(default)]
    watchdog: WatchdogConfig,
    #[serde(default)]
    printers: Vec<PrinterConfigBambu>,
}

#[derive(Clone)]
pub struct AppConfig {
    log_dir: Option<PathBuf>,
    watchdog: WatchdogConfig,

    printers: Arc<DashMap<PrinterId, Arc<RwLock<PrinterConfigBambu>>>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::empty()
    }
}

/// getters
impl AppConfig {
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    pub fn watchdog(&self) -> &WatchdogConfig {
        &self.watchdog
    }
}

/// save, load
impl AppConfig {
    pub fn empty() -> Self {
        Self {
            log_dir: None,
            watchdog: WatchdogConfig::default(),
            printers: Arc::new(DashMap::new()),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(s).context("parsing config")?;

        let out = Self {
            log_dir: file.log_dir,
            watchdog: file.watchdog,
            printers: Arc::new(DashMap::new()),
        };
        for printer in file.printers {
            printer.validate()?;
            out.add_printer(printer)?;
        }
        Ok(out)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("loading config from {:?}", path);
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        Self::from_toml_str(&s)
    }

    /// Single printer from `BAMBU_*` environment variables
    pub fn from_env() -> Result<Self> {
        let out = Self::empty();
        out.add_printer(PrinterConfigBambu::from_env()?)?;
        Ok(out)
    }

    pub async fn to_toml_string(&self) -> Result<String> {
        let mut printers = Vec::with_capacity(self.printers.len());
        for printer in self.printers() {
            printers.push(printer.read().await.clone());
        }
        printers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        let file = ConfigFile {
            log_dir: self.log_dir.clone(),
            watchdog: self.watchdog,
            printers,
        };
        toml::to_string_pretty(&file).context("serializing config")
    }

    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let s = self.to_toml_string().await?;
        std::fs::write(path, s).with_context(|| format!("writing config file {:?}", path))?;
        debug!("saved config to {:?}", path);
        Ok(())
    }
}

impl AppConfig {
    pub fn add_printer(&self, config: PrinterConfigBambu) -> Result<PrinterId> {
        let id = config.id.clone();
        match self.printers.entry(id.clone()) {
            Entry::Occupied(_) => bail!("printer already exists: {}", id.to_string()),
            Entry::Vacant(v) => {
                v.insert(Arc::new(RwLock::new(config)));
            }
        }
        Ok(id)
    }

    pub fn remove_printer(&self, id: &PrinterId) -> Option<Arc<RwLock<PrinterConfigBambu>>> {
        self.printers.remove(id).map(|(_, v)| v)
    }

    pub fn printer_ids(&self) -> Vec<PrinterId> {
        let mut ids: Vec<_> = self.printers.iter().map(|v| v.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn printers(&self) -> Vec<Arc<RwLock<PrinterConfigBambu>>> {
        self.printers.iter().map(|v| v.value().clone()).collect()
    }

    pub fn get_printer(&self, id: &PrinterId) -> Option<Arc<RwLock<PrinterConfigBambu>>> {
        self.printers.get(id).map(|v| v.value().clone())
    }
}
