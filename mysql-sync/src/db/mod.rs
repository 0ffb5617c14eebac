//! Database Gateway: trigger setup, change-log polling, row apply, and
//! `sync_status` maintenance.

pub mod connection;
pub mod error;
pub mod gateway;
pub mod mysql;

pub use connection::{ChangeLogRow, Connection, Entity};
pub use error::Error;
pub use gateway::{ConnectionFactory, DatabaseGateway, MysqlConnectionFactory};
pub use mysql::MysqlConnection;
