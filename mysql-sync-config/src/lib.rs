//! Configuration loading and validation.

pub mod bus;
pub mod core;
pub mod database;
pub mod error;
pub mod general;
pub mod logging;

pub use bus::BusConfig;
pub use core::Config;
pub use database::DatabaseConfig;
pub use error::Error;
pub use logging::LoggingLevel;

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "mqttConfig": {{ "host": "localhost", "port": 1883 }},
                "mysqlConfig": {{ "host": "localhost", "port": 3306, "user": "root", "password": "", "database": "app" }},
                "syncTables": ["users"],
                "receiveTables": ["users"],
                "clientName": "node-a",
                "remoteClients": ["node-b"],
                "queueDirectory": "/tmp/mysql-sync-queues",
                "checkInterval": 1000
            }}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.client_name, "node-a");
        assert_eq!(config.check_interval, 1000);
        assert_eq!(config.logging_level, LoggingLevel::Info);
        assert!(config.bidirectional_tables().contains("users"));
    }

    #[test]
    fn rejects_bad_client_name() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "mqttConfig": {{ "host": "localhost", "port": 1883 }},
                "mysqlConfig": {{ "host": "localhost", "port": 3306, "user": "root", "password": "", "database": "app" }},
                "syncTables": [],
                "receiveTables": [],
                "clientName": "a",
                "remoteClients": [],
                "queueDirectory": "/tmp/mysql-sync-queues",
                "checkInterval": 1000
            }}"#
        )
        .unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidClientName(_)));
    }
}
