use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use serde::{Deserialize, Serialize};
use std::env;

use super::printer_id::PrinterId;

pub const DEFAULT_MQTT_PORT: u16 = 8883;

fn default_port() -> u16 {
    DEFAULT_MQTT_PORT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterConfigBambu {
    #[serde(default = "PrinterId::generate")]
    pub id: PrinterId,
    pub serial: String,
    pub name: String,
    pub host: String,
    /// LAN access code, shown on the printer's screen
    pub access_code: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl PrinterConfigBambu {
    pub fn new(serial: String, name: String, host: String, access_code: String) -> Self {
        Self::from_id(serial, name, host, access_code, PrinterId::generate())
    }

    pub fn from_id(
        serial: String,
        name: String,
        host: String,
        access_code: String,
        id: PrinterId,
    ) -> Self {
        Self {
            id,
            serial,
            name,
            host,
            access_code,
            port: DEFAULT_MQTT_PORT,
        }
    }

    /// `BAMBU_IP`, `BAMBU_ACCESS_CODE`, `BAMBU_IDENT` and optionally `BAMBU_ID`
    pub fn from_env() -> Result<Self> {
        let host = env::var("BAMBU_IP").context("BAMBU_IP not set")?;
        let access_code = env::var("BAMBU_ACCESS_CODE").context("BAMBU_ACCESS_CODE not set")?;
        let serial = env::var("BAMBU_IDENT").context("BAMBU_IDENT not set")?;
        let id = match env::var("BAMBU_ID") {
            Ok(id) if !id.is_empty() => PrinterId::parse(&id).context("BAMBU_ID")?,
            _ => PrinterId::generate(),
        };
        let name = format!("printer_{}", serial.get(serial.len().saturating_sub(4)..).unwrap_or(""));

        let out = Self::from_id(serial, name, host, access_code, id);
        out.validate()?;
        Ok(out)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.host.is_empty(), "printer {:?}: missing host", self.name);
        ensure!(!self.serial.is_empty(), "printer {:?}: missing serial", self.name);
        ensure!(
            !self.access_code.is_empty(),
            "printer {:?}: missing access code",
            self.name
        );
        Ok(())
    }
}
