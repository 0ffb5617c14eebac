use std::collections::HashSet;
use std::fs::{create_dir_all, read_to_string};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bus::BusConfig;
use crate::database::DatabaseConfig;
use crate::error::Error;
use crate::general;
use crate::logging::LoggingLevel;

/// The full configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "mqttConfig")]
    pub mqtt_config: BusConfig,
    #[serde(rename = "mysqlConfig")]
    pub mysql_config: DatabaseConfig,
    #[serde(rename = "syncTables")]
    pub sync_tables: Vec<String>,
    #[serde(rename = "receiveTables")]
    pub receive_tables: Vec<String>,
    #[serde(rename = "clientName")]
    pub client_name: String,
    #[serde(rename = "remoteClients")]
    pub remote_clients: Vec<String>,
    #[serde(rename = "queueDirectory")]
    pub queue_directory: PathBuf,
    #[serde(rename = "checkInterval")]
    pub check_interval: u64,
    #[serde(rename = "loggingLevel", default)]
    pub logging_level: LoggingLevel,
    #[serde(rename = "transformerDirectory")]
    pub transformer_directory: Option<PathBuf>,
}

impl Config {
    /// Load, parse and validate the configuration file, creating
    /// `queueDirectory`/`transformerDirectory` if absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = read_to_string(path).map_err(|e| Error::Io(path.to_path_buf(), e))?;
        let mut config: Config =
            serde_json::from_str(&raw).map_err(|e| Error::Parse(path.to_path_buf(), e))?;

        config.check()?;
        config.mqtt_config.resolve_tls_material()?;
        config.ensure_directories()?;

        info!("loaded \"{}\"", path.display());

        Ok(config)
    }

    fn check(&self) -> Result<(), Error> {
        if !general::is_valid_client_name(&self.client_name) {
            return Err(Error::InvalidClientName(self.client_name.clone()));
        }

        if self.check_interval < 1 {
            return Err(Error::InvalidCheckInterval(self.check_interval));
        }

        Ok(())
    }

    fn ensure_directories(&self) -> Result<(), Error> {
        create_dir_all(&self.queue_directory)
            .map_err(|e| Error::Io(self.queue_directory.clone(), e))?;

        if let Some(dir) = &self.transformer_directory {
            create_dir_all(dir).map_err(|e| Error::Io(dir.clone(), e))?;
        }

        Ok(())
    }

    /// Tables captured *and* accepted — the echo-suppression set.
    pub fn bidirectional_tables(&self) -> HashSet<String> {
        let receive: HashSet<&String> = self.receive_tables.iter().collect();
        self.sync_tables
            .iter()
            .filter(|t| receive.contains(t))
            .cloned()
            .collect()
    }

    pub fn is_sync_table(&self, table: &str) -> bool {
        self.sync_tables.iter().any(|t| t == table)
    }

    pub fn is_receive_table(&self, table: &str) -> bool {
        self.receive_tables.iter().any(|t| t == table)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bidirectional_is_intersection() {
        let config = Config {
            mqtt_config: BusConfig {
                host: "localhost".into(),
                port: 1883,
                username: None,
                password: None,
                ca: None,
                cert: None,
                key: None,
                ca_bytes: vec![],
                cert_bytes: vec![],
                key_bytes: vec![],
            },
            mysql_config: DatabaseConfig {
                host: "localhost".into(),
                port: 3306,
                user: "root".into(),
                password: "".into(),
                database: "app".into(),
                connect_timeout_ms: 5000,
            },
            sync_tables: vec!["users".into(), "orders".into()],
            receive_tables: vec!["orders".into(), "invoices".into()],
            client_name: "node-a".into(),
            remote_clients: vec!["node-b".into()],
            queue_directory: "/tmp/mysql-sync".into(),
            check_interval: 1000,
            logging_level: LoggingLevel::Info,
            transformer_directory: None,
        };

        let bidi = config.bidirectional_tables();
        assert_eq!(bidi.len(), 1);
        assert!(bidi.contains("orders"));
    }
}
