//! [`Connection`] backed by `mysql_async`, the ecosystem-standard async
//! MySQL client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Row as MyRow, Value as MyValue};
use serde_json::Value;
use tracing::{debug, info};

use mysql_sync_config::DatabaseConfig;

use super::connection::{ChangeLogRow, Connection, Entity};
use super::error::Error;

pub struct MysqlConnection {
    conn: Conn,
    pk_cache: HashMap<String, String>,
}

impl MysqlConnection {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, Error> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.database.clone()))
            .tcp_connect_timeout(Some(Duration::from_millis(config.connect_timeout_ms)));

        let conn = Conn::new(opts)
            .await
            .map_err(|e| Error::Query(e.to_string()))?;

        Ok(Self {
            conn,
            pk_cache: HashMap::new(),
        })
    }

    fn row_to_entity(row: MyRow) -> Entity {
        let columns: Vec<String> = row
            .columns_ref()
            .iter()
            .map(|c| c.name_str().to_string())
            .collect();

        let mut entity = Entity::new();
        let mut row = row;
        for (index, column) in columns.into_iter().enumerate() {
            let value: MyValue = row.take(index).unwrap_or(MyValue::NULL);
            entity.insert(column, mysql_value_to_json(value));
        }
        entity
    }
}

fn mysql_value_to_json(value: MyValue) -> Value {
    match value {
        MyValue::NULL => Value::Null,
        MyValue::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => Value::String(s),
            Err(e) => Value::String(format!("{:?}", e.into_bytes())),
        },
        MyValue::Int(i) => Value::from(i),
        MyValue::UInt(u) => Value::from(u),
        MyValue::Float(f) => Value::from(f),
        MyValue::Double(d) => Value::from(d),
        MyValue::Date(year, month, day, hour, minute, second, micro) => Value::String(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            year, month, day, hour, minute, second, micro
        )),
        MyValue::Time(neg, days, hours, minutes, seconds, micros) => Value::String(format!(
            "{}{}:{:02}:{:02}:{:02}.{:06}",
            if neg { "-" } else { "" },
            days as u32 * 24 + hours as u32,
            minutes,
            seconds,
            micros
        )),
    }
}

fn json_to_mysql_value(value: &Value) -> MyValue {
    match value {
        Value::Null => MyValue::NULL,
        Value::Bool(b) => MyValue::Int(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                MyValue::Int(i)
            } else if let Some(f) = n.as_f64() {
                MyValue::Double(f)
            } else {
                MyValue::NULL
            }
        }
        Value::String(s) => MyValue::Bytes(s.as_bytes().to_vec()),
        other => MyValue::Bytes(other.to_string().into_bytes()),
    }
}

const TRIGGER_PREFIX: &str = "mysqlSync";

#[async_trait]
impl Connection for MysqlConnection {
    async fn ping(&mut self) -> Result<(), Error> {
        let _: String = self
            .conn
            .query_first("SELECT 'connected'")
            .await
            .map_err(|e| Error::Query(e.to_string()))?
            .ok_or(Error::NotConnected)?;
        Ok(())
    }

    async fn setup(&mut self, sync_tables: &[String]) -> Result<(), Error> {
        self.conn
            .query_drop(
                "CREATE TABLE IF NOT EXISTS table_changes (
                    id INT AUTO_INCREMENT PRIMARY KEY,
                    table_name VARCHAR(255) NOT NULL,
                    primary_key VARCHAR(255) NOT NULL,
                    date DATETIME NOT NULL)",
            )
            .await
            .map_err(|e| Error::Query(e.to_string()))?;

        self.conn
            .query_drop(
                "CREATE TABLE IF NOT EXISTS sync_status (
                    id VARCHAR(32) PRIMARY KEY,
                    table_name VARCHAR(255) NOT NULL,
                    primary_key VARCHAR(255) NOT NULL,
                    remote VARCHAR(32) NOT NULL,
                    date DATETIME NOT NULL,
                    status ENUM('successful','pending','error') NOT NULL,
                    message VARCHAR(255) NULL)",
            )
            .await
            .map_err(|e| Error::Query(e.to_string()))?;

        let existing: Vec<(String, String)> = self
            .conn
            .query(
                "SELECT TRIGGER_NAME, EVENT_OBJECT_TABLE FROM INFORMATION_SCHEMA.TRIGGERS
                 WHERE TRIGGER_SCHEMA = DATABASE() AND TRIGGER_NAME LIKE 'mysqlSync%'",
            )
            .await
            .map_err(|e| Error::Query(e.to_string()))?;

        for (trigger_name, _) in existing {
            self.conn
                .query_drop(format!("DROP TRIGGER IF EXISTS `{}`", trigger_name))
                .await
                .map_err(|e| Error::Query(e.to_string()))?;
            debug!("dropped stale trigger \"{}\"", trigger_name);
        }

        for table in sync_tables {
            let pk = self.primary_key_column(table).await?;

            for (suffix, timing, new_or_old) in [
                ("Insert", "AFTER INSERT", "NEW"),
                ("Update", "AFTER UPDATE", "NEW"),
                ("Delete", "AFTER DELETE", "OLD"),
            ] {
                let name = format!("{}{}_{}", TRIGGER_PREFIX, suffix, table);
                let query = format!(
                    "CREATE TRIGGER `{name}` {timing} ON `{table}` FOR EACH ROW
                     INSERT INTO table_changes (table_name, primary_key, date)
                     VALUES ('{table}', {new_or_old}.`{pk}`, NOW())"
                );
                self.conn
                    .query_drop(query)
                    .await
                    .map_err(|e| Error::Query(e.to_string()))?;
            }

            info!("installed mysqlSync triggers for \"{}\"", table);
        }

        Ok(())
    }

    async fn primary_key_column(&mut self, table: &str) -> Result<String, Error> {
        if let Some(pk) = self.pk_cache.get(table) {
            return Ok(pk.clone());
        }

        let pk: Option<String> = self
            .conn
            .exec_first(
                "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = :table
                   AND CONSTRAINT_NAME = 'PRIMARY' LIMIT 1",
                params! { "table" => table },
            )
            .await
            .map_err(|e| Error::Query(e.to_string()))?;

        let pk = pk.ok_or_else(|| Error::MissingPrimaryKey(table.to_string()))?;
        self.pk_cache.insert(table.to_string(), pk.clone());
        Ok(pk)
    }

    async fn poll_next_change(&mut self) -> Result<Option<ChangeLogRow>, Error> {
        let row: Option<(u64, String, String)> = self
            .conn
            .query_first(
                "SELECT id, table_name, primary_key FROM table_changes
                 ORDER BY date ASC, id ASC LIMIT 1",
            )
            .await
            .map_err(|e| Error::Query(e.to_string()))?;

        let Some((id, table_name, primary_key)) = row else {
            return Ok(None);
        };

        self.conn
            .exec_drop(
                "DELETE FROM table_changes WHERE id = :id",
                params! { "id" => id },
            )
            .await
            .map_err(|e| Error::Query(e.to_string()))?;

        Ok(Some(ChangeLogRow {
            table_name,
            primary_key,
        }))
    }

    async fn delete_change_log_rows(&mut self, table: &str, id: &str) -> Result<(), Error> {
        self.conn
            .exec_drop(
                "DELETE FROM table_changes WHERE table_name = :table AND primary_key = :id",
                params! { "table" => table, "id" => id },
            )
            .await
            .map_err(|e| Error::Query(e.to_string()))
    }

    async fn fetch_row(
        &mut self,
        table: &str,
        pk_col: &str,
        id: &str,
    ) -> Result<Option<Entity>, Error> {
        let query = format!("SELECT * FROM `{table}` WHERE `{pk_col}` = :id LIMIT 1");
        let row: Option<MyRow> = self
            .conn
            .exec_first(query, params! { "id" => id })
            .await
            .map_err(|e| Error::Query(e.to_string()))?;

        Ok(row.map(Self::row_to_entity))
    }

    async fn row_exists(&mut self, table: &str, pk_col: &str, id: &str) -> Result<bool, Error> {
        let query = format!("SELECT COUNT(*) FROM `{table}` WHERE `{pk_col}` = :id");
        let count: u64 = self
            .conn
            .exec_first(query, params! { "id" => id })
            .await
            .map_err(|e| Error::Query(e.to_string()))?
            .unwrap_or(0);
        Ok(count > 0)
    }

    async fn insert_row(&mut self, table: &str, entity: &Entity) -> Result<(), Error> {
        let columns: Vec<&String> = entity.keys().collect();
        let column_list = columns
            .iter()
            .map(|c| format!("`{c}`"))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = columns
            .iter()
            .map(|c| format!(":{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        let query = format!("INSERT INTO `{table}` ({column_list}) VALUES ({placeholders})");
        let params: Vec<(String, MyValue)> = entity
            .iter()
            .map(|(k, v)| (k.clone(), json_to_mysql_value(v)))
            .collect();

        self.conn
            .exec_drop(query, mysql_async::Params::from(params))
            .await
            .map_err(|e| Error::Query(e.to_string()))
    }

    async fn update_row(
        &mut self,
        table: &str,
        pk_col: &str,
        id: &str,
        entity: &Entity,
    ) -> Result<(), Error> {
        let assignments = entity
            .keys()
            .map(|c| format!("`{c}` = :{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        let query = format!("UPDATE `{table}` SET {assignments} WHERE `{pk_col}` = :__id");
        let mut params: Vec<(String, MyValue)> = entity
            .iter()
            .map(|(k, v)| (k.clone(), json_to_mysql_value(v)))
            .collect();
        params.push(("__id".to_string(), MyValue::Bytes(id.as_bytes().to_vec())));

        self.conn
            .exec_drop(query, mysql_async::Params::from(params))
            .await
            .map_err(|e| Error::Query(e.to_string()))
    }

    async fn delete_row(&mut self, table: &str, pk_col: &str, id: &str) -> Result<(), Error> {
        let query = format!("DELETE FROM `{table}` WHERE `{pk_col}` = :id");
        self.conn
            .exec_drop(query, params! { "id" => id })
            .await
            .map_err(|e| Error::Query(e.to_string()))
    }

    async fn status_date(&mut self, status_id: &str) -> Result<Option<i64>, Error> {
        let date: Option<i64> = self
            .conn
            .exec_first(
                "SELECT UNIX_TIMESTAMP(date) * 1000 FROM sync_status WHERE id = :id",
                params! { "id" => status_id },
            )
            .await
            .map_err(|e| Error::Query(e.to_string()))?;
        Ok(date)
    }

    async fn upsert_status(
        &mut self,
        status_id: &str,
        table: &str,
        id: &str,
        sender: &str,
        date: i64,
        status: &str,
        message: Option<&str>,
    ) -> Result<(), Error> {
        self.conn
            .exec_drop(
                "INSERT INTO sync_status (id, table_name, primary_key, remote, date, status, message)
                 VALUES (:id, :table, :pk, :remote, FROM_UNIXTIME(:date / 1000), :status, :message)
                 ON DUPLICATE KEY UPDATE
                    date = VALUES(date), status = VALUES(status), message = VALUES(message)",
                params! {
                    "id" => status_id,
                    "table" => table,
                    "pk" => id,
                    "remote" => sender,
                    "date" => date,
                    "status" => status,
                    "message" => message,
                },
            )
            .await
            .map_err(|e| Error::Query(e.to_string()))
    }
}
