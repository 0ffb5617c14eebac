use serde::{Deserialize, Serialize};

/// `mysqlConfig` — passed through to `mysql_async::OptsBuilder`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "DatabaseConfig::default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    /// TCP connect timeout, milliseconds.
    #[serde(default = "DatabaseConfig::default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl DatabaseConfig {
    fn default_port() -> u16 {
        3306
    }

    fn default_connect_timeout() -> u64 {
        5_000
    }
}
