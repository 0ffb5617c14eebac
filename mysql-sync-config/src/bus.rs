use std::fs::read;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// `mqttConfig`. `ca`/`cert`/`key` start as file paths and are resolved
/// into byte buffers by `resolve_tls_material` once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub host: String,
    #[serde(default = "BusConfig::default_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default)]
    pub ca_bytes: Vec<u8>,
    #[serde(default)]
    pub cert_bytes: Vec<u8>,
    #[serde(default)]
    pub key_bytes: Vec<u8>,
}

impl BusConfig {
    fn default_port() -> u16 {
        1883
    }

    /// Load any path-valued TLS material into memory. Called once at
    /// startup by `BusGateway::connect`.
    pub fn resolve_tls_material(&mut self) -> Result<(), Error> {
        if let Some(path) = &self.ca {
            self.ca_bytes = read(path).map_err(|e| Error::Io(path.clone(), e))?;
        }
        if let Some(path) = &self.cert {
            self.cert_bytes = read(path).map_err(|e| Error::Io(path.clone(), e))?;
        }
        if let Some(path) = &self.key {
            self.key_bytes = read(path).map_err(|e| Error::Io(path.clone(), e))?;
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        !self.ca_bytes.is_empty() || !self.cert_bytes.is_empty()
    }
}
