//! Owns the single database connection exclusively, drives
//! setup/reconnect on every tick, polls `table_changes` in date order,
//! and applies incoming changes/status updates routed to it by the
//! Event Hub.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use mysql_sync_config::DatabaseConfig;

use super::connection::{Connection, Entity};
use super::error::Error;
use crate::hub::{
    ApplicationEvent, Change, DatabaseChangeError, DatabaseChangeInfo, EventHub, EventKind,
    Listener, Status, StatusKind,
};
use crate::queue::FileQueue;

/// `sync_status.message` is `VARCHAR(255)`. A status write whose
/// message exceeds this is truncated rather than failed.
const STATUS_MESSAGE_LIMIT: usize = 255;

/// Builds a fresh [`Connection`] when the gateway needs to (re)connect.
/// Indirected behind a trait so tests can substitute an in-memory fake
/// without a live MySQL server.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, Error>;
}

pub struct MysqlConnectionFactory {
    pub config: DatabaseConfig,
}

#[async_trait]
impl ConnectionFactory for MysqlConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        let conn = super::mysql::MysqlConnection::connect(&self.config).await?;
        Ok(Box::new(conn))
    }
}

/// What's sitting in the `database` queue while the connection is down:
/// either a change waiting to be applied or a status envelope waiting
/// to be written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum QueuedDbOp {
    Change(Change),
    Status(Status),
}

pub struct DatabaseGateway {
    hub: Arc<EventHub>,
    factory: Box<dyn ConnectionFactory>,
    sync_tables: Vec<String>,
    bidirectional: HashSet<String>,
    conn: AsyncMutex<Option<Box<dyn Connection>>>,
    queue: FileQueue<QueuedDbOp>,
}

impl DatabaseGateway {
    pub async fn new(
        hub: Arc<EventHub>,
        factory: Box<dyn ConnectionFactory>,
        sync_tables: Vec<String>,
        bidirectional: HashSet<String>,
        queue_path: impl AsRef<std::path::Path>,
    ) -> Result<Arc<Self>, Error> {
        let queue = FileQueue::open(queue_path).await?;
        Ok(Arc::new(Self {
            hub,
            factory,
            sync_tables,
            bidirectional,
            conn: AsyncMutex::new(None),
            queue,
        }))
    }

    async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Driven by the Event Hub's tick loop. Verifies connectivity,
    /// (re)connects and runs setup on success, drains the `database`
    /// queue, then polls one change-log row.
    pub async fn tick(&self) -> Result<(), Error> {
        if self.ensure_connected().await? {
            self.poll_and_emit_change().await?;
        }
        Ok(())
    }

    /// Returns `true` once the gateway has a live connection, attempting
    /// a reconnect (+ setup) if the liveness probe fails.
    async fn ensure_connected(&self) -> Result<bool, Error> {
        let was_connected;
        {
            let mut guard = self.conn.lock().await;
            was_connected = guard.is_some();
            if let Some(conn) = guard.as_mut() {
                if conn.ping().await.is_ok() {
                    return Ok(true);
                }
            }
            *guard = None;
        }

        if was_connected {
            self.hub.emit(ApplicationEvent::DatabaseDisconnect).await?;
        }

        match self.factory.connect().await {
            Ok(mut new_conn) => {
                if let Err(err) = new_conn.setup(&self.sync_tables).await {
                    self.hub
                        .emit(ApplicationEvent::DatabaseError((&err).into()))
                        .await?;
                    return Ok(false);
                }
                {
                    let mut guard = self.conn.lock().await;
                    *guard = Some(new_conn);
                }
                info!("database connection established");
                self.hub.emit(ApplicationEvent::DatabaseConnect).await?;
                self.drain_queue().await?;
                Ok(true)
            }
            Err(err) => {
                self.hub
                    .emit(ApplicationEvent::DatabaseError((&err).into()))
                    .await?;
                Ok(false)
            }
        }
    }

    /// One change per tick.
    async fn poll_and_emit_change(&self) -> Result<(), Error> {
        let row = {
            let mut guard = self.conn.lock().await;
            let Some(conn) = guard.as_mut() else {
                return Ok(());
            };
            conn.poll_next_change().await?
        };

        let Some(row) = row else {
            return Ok(());
        };

        let entity = {
            let mut guard = self.conn.lock().await;
            let Some(conn) = guard.as_mut() else {
                return Ok(());
            };
            let pk_col = conn.primary_key_column(&row.table_name).await?;
            conn.fetch_row(&row.table_name, &pk_col, &row.primary_key)
                .await?
        };

        self.hub
            .emit(ApplicationEvent::LocalChange {
                table: row.table_name,
                id: row.primary_key,
                entity,
                except: None,
            })
            .await?;

        Ok(())
    }

    /// Poll the `database` queue until empty or disconnected, replaying
    /// each item through the normal apply/status-apply path.
    async fn drain_queue(&self) -> Result<(), Error> {
        loop {
            let Some(op) = self.queue.poll().await? else {
                return Ok(());
            };
            match op {
                QueuedDbOp::Change(change) => self.apply_change(&change).await?,
                QueuedDbOp::Status(status) => self.apply_status(&status).await?,
            }
            if !self.is_connected().await {
                return Ok(());
            }
        }
    }

    /// Apply a single change. Used both for the `local-save-change`
    /// listener path and for queue replay.
    async fn apply_change(&self, change: &Change) -> Result<(), Error> {
        if !self.is_connected().await {
            self.queue.push(QueuedDbOp::Change(change.clone())).await?;
            return self.fail(change, "Could not connect to database").await;
        }

        match self.try_apply_change(change).await {
            Ok(()) => {
                self.hub
                    .emit(ApplicationEvent::LocalSaveSuccessful(DatabaseChangeInfo {
                        change: change.clone(),
                    }))
                    .await?;
                Ok(())
            }
            Err(Error::IdMismatch) => self.fail(change, "Sent id does not match entity id!").await,
            Err(err) => {
                let message = err.to_string();
                self.fail(change, &message).await
            }
        }
    }

    async fn try_apply_change(&self, change: &Change) -> Result<(), Error> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::NotConnected)?;

        let pk = conn.primary_key_column(&change.table).await?;

        if let Some(entity) = &change.entity {
            if !entity_id_matches(entity, &pk, &change.id) {
                return Err(Error::IdMismatch);
            }
        }

        let exists = conn.row_exists(&change.table, &pk, &change.id).await?;

        match &change.entity {
            Some(entity) if exists => conn.update_row(&change.table, &pk, &change.id, entity).await?,
            Some(entity) => conn.insert_row(&change.table, entity).await?,
            None => conn.delete_row(&change.table, &pk, &change.id).await?,
        }

        if self.bidirectional.contains(&change.table) {
            conn.delete_change_log_rows(&change.table, &change.id).await?;
            drop(guard);
            self.hub
                .emit(ApplicationEvent::LocalChange {
                    table: change.table.clone(),
                    id: change.id.clone(),
                    entity: change.entity.clone(),
                    except: Some(change.sender.clone()),
                })
                .await?;
        }

        Ok(())
    }

    async fn fail(&self, change: &Change, message: &str) -> Result<(), Error> {
        self.hub
            .emit(ApplicationEvent::LocalSaveFailed(DatabaseChangeError {
                change: change.clone(),
                message: message.to_string(),
            }))
            .await?;
        Ok(())
    }

    /// Apply a status update, preserving the highest-seen date for a
    /// given (table, id, sender).
    async fn apply_status(&self, status: &Status) -> Result<(), Error> {
        if !self.is_connected().await {
            self.queue.push(QueuedDbOp::Status(status.clone())).await?;
            return Ok(());
        }

        let status_id = status.status_id();
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(Error::NotConnected)?;

        if let Some(existing_date) = conn.status_date(&status_id).await? {
            if existing_date >= status.date {
                return Ok(());
            }
        }

        let (message, truncated) = match &status.message {
            Some(m) => truncate_message(m),
            None => (String::new(), false),
        };
        if truncated {
            warn!(
                table = %status.table,
                id = %status.id,
                "sync_status.message truncated to {} bytes",
                STATUS_MESSAGE_LIMIT
            );
        }
        let message = if status.message.is_some() {
            Some(message.as_str())
        } else {
            None
        };

        conn.upsert_status(
            &status_id,
            &status.table,
            &status.id,
            &status.sender,
            status.date,
            status_kind_str(status.status),
            message,
        )
        .await?;

        Ok(())
    }
}

fn status_kind_str(kind: StatusKind) -> &'static str {
    match kind {
        StatusKind::Successful => "successful",
        StatusKind::Pending => "pending",
        StatusKind::Error => "error",
    }
}

fn entity_id_matches(entity: &Entity, pk: &str, id: &str) -> bool {
    match entity.get(pk) {
        Some(value) => value_to_id_string(value) == id,
        None => true,
    }
}

fn value_to_id_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truncate_message(message: &str) -> (String, bool) {
    if message.len() <= STATUS_MESSAGE_LIMIT {
        return (message.to_string(), false);
    }
    let mut end = STATUS_MESSAGE_LIMIT;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    (message[..end].to_string(), true)
}

#[async_trait]
impl Listener for DatabaseGateway {
    async fn handle(&self, event: &ApplicationEvent) -> Result<(), crate::hub::Error> {
        match event {
            ApplicationEvent::LocalSaveChange(change) => self
                .apply_change(change)
                .await
                .map_err(|e| crate::hub::Error::Listener(EventKind::LocalSaveChange, e.to_string())),
            ApplicationEvent::RemoteStatusChange(status) => self
                .apply_status(status)
                .await
                .map_err(|e| crate::hub::Error::Listener(EventKind::RemoteStatusChange, e.to_string())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::connection::ChangeLogRow;
    use crate::hub::{ApplicationEvent, EventKind};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as SyncMutex;

    #[derive(Default)]
    struct FakeConnection {
        rows: SyncMutex<BTreeMap<String, Entity>>,
        change_log: SyncMutex<Vec<(String, String)>>,
        statuses: SyncMutex<BTreeMap<String, (i64, String)>>,
        pk: String,
        fail_ping: AtomicBool,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn ping(&mut self) -> Result<(), Error> {
            if self.fail_ping.load(Ordering::SeqCst) {
                Err(Error::NotConnected)
            } else {
                Ok(())
            }
        }

        async fn setup(&mut self, _sync_tables: &[String]) -> Result<(), Error> {
            Ok(())
        }

        async fn primary_key_column(&mut self, _table: &str) -> Result<String, Error> {
            Ok(self.pk.clone())
        }

        async fn poll_next_change(&mut self) -> Result<Option<ChangeLogRow>, Error> {
            Ok(None)
        }

        async fn delete_change_log_rows(&mut self, table: &str, id: &str) -> Result<(), Error> {
            self.change_log
                .lock()
                .unwrap()
                .retain(|(t, i)| !(t == table && i == id));
            Ok(())
        }

        async fn fetch_row(
            &mut self,
            _table: &str,
            _pk_col: &str,
            id: &str,
        ) -> Result<Option<Entity>, Error> {
            Ok(self.rows.lock().unwrap().get(id).cloned())
        }

        async fn row_exists(&mut self, _table: &str, _pk_col: &str, id: &str) -> Result<bool, Error> {
            Ok(self.rows.lock().unwrap().contains_key(id))
        }

        async fn insert_row(&mut self, _table: &str, entity: &Entity) -> Result<(), Error> {
            let id = entity.get(&self.pk).map(value_to_id_string).unwrap();
            self.rows.lock().unwrap().insert(id, entity.clone());
            Ok(())
        }

        async fn update_row(
            &mut self,
            _table: &str,
            _pk_col: &str,
            id: &str,
            entity: &Entity,
        ) -> Result<(), Error> {
            self.rows.lock().unwrap().insert(id.to_string(), entity.clone());
            Ok(())
        }

        async fn delete_row(&mut self, _table: &str, _pk_col: &str, id: &str) -> Result<(), Error> {
            self.rows.lock().unwrap().remove(id);
            Ok(())
        }

        async fn status_date(&mut self, status_id: &str) -> Result<Option<i64>, Error> {
            Ok(self.statuses.lock().unwrap().get(status_id).map(|(d, _)| *d))
        }

        async fn upsert_status(
            &mut self,
            status_id: &str,
            _table: &str,
            _id: &str,
            _sender: &str,
            date: i64,
            status: &str,
            _message: Option<&str>,
        ) -> Result<(), Error> {
            self.statuses
                .lock()
                .unwrap()
                .insert(status_id.to_string(), (date, status.to_string()));
            Ok(())
        }
    }

    struct FakeFactory {
        pk: String,
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        async fn connect(&self) -> Result<Box<dyn Connection>, Error> {
            Ok(Box::new(FakeConnection {
                pk: self.pk.clone(),
                ..Default::default()
            }))
        }
    }

    fn change(sender: &str, table: &str, id: &str, entity: Option<Entity>) -> Change {
        Change {
            sender: sender.into(),
            table: table.into(),
            id: id.into(),
            date: 1000,
            entity,
        }
    }

    fn entity_with(pk: &str, id: &str) -> Entity {
        let mut e = Entity::new();
        e.insert(pk.into(), serde_json::Value::String(id.into()));
        e
    }

    async fn record_events(hub: &Arc<EventHub>, kinds: &[EventKind]) -> Arc<SyncMutex<Vec<ApplicationEvent>>> {
        let record = Arc::new(SyncMutex::new(Vec::new()));

        struct Rec(Arc<SyncMutex<Vec<ApplicationEvent>>>);
        #[async_trait]
        impl Listener for Rec {
            async fn handle(&self, event: &ApplicationEvent) -> Result<(), crate::hub::Error> {
                self.0.lock().unwrap().push(event.clone());
                Ok(())
            }
        }

        for kind in kinds {
            hub.on(*kind, Arc::new(Rec(record.clone())));
        }
        record
    }

    #[tokio::test]
    async fn id_mismatch_fails_with_exact_message() {
        let dir = tempfile::tempdir().unwrap();
        let hub = EventHub::new();
        let record = record_events(&hub, &[EventKind::LocalSaveFailed]).await;

        let gateway = DatabaseGateway::new(
            hub.clone(),
            Box::new(FakeFactory { pk: "id".into() }),
            vec!["users".into()],
            HashSet::new(),
            dir.path().join("database.json"),
        )
        .await
        .unwrap();

        gateway.tick().await.unwrap();

        let bad = change("peer-b", "users", "u1", Some(entity_with("id", "u2")));
        gateway
            .handle(&ApplicationEvent::LocalSaveChange(bad))
            .await
            .unwrap();

        let events = record.lock().unwrap();
        match &events[0] {
            ApplicationEvent::LocalSaveFailed(err) => {
                assert_eq!(err.message, "Sent id does not match entity id!");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn disconnected_apply_queues_and_fails() {
        let dir = tempfile::tempdir().unwrap();
        let hub = EventHub::new();
        let record = record_events(&hub, &[EventKind::LocalSaveFailed]).await;

        let gateway = DatabaseGateway::new(
            hub.clone(),
            Box::new(FakeFactory { pk: "id".into() }),
            vec!["users".into()],
            HashSet::new(),
            dir.path().join("database.json"),
        )
        .await
        .unwrap();
        // Never ticked: gateway starts disconnected.

        let c = change("peer-b", "users", "u1", Some(entity_with("id", "u1")));
        gateway
            .handle(&ApplicationEvent::LocalSaveChange(c))
            .await
            .unwrap();

        let events = record.lock().unwrap();
        match &events[0] {
            ApplicationEvent::LocalSaveFailed(err) => {
                assert_eq!(err.message, "Could not connect to database");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn bidirectional_apply_echoes_with_except_sender() {
        let dir = tempfile::tempdir().unwrap();
        let hub = EventHub::new();
        let record = record_events(&hub, &[EventKind::LocalChange]).await;

        let mut bidi = HashSet::new();
        bidi.insert("users".to_string());

        let gateway = DatabaseGateway::new(
            hub.clone(),
            Box::new(FakeFactory { pk: "id".into() }),
            vec!["users".into()],
            bidi,
            dir.path().join("database.json"),
        )
        .await
        .unwrap();
        gateway.tick().await.unwrap();

        let c = change("peer-b", "users", "u1", Some(entity_with("id", "u1")));
        gateway
            .handle(&ApplicationEvent::LocalSaveChange(c))
            .await
            .unwrap();

        let events = record.lock().unwrap();
        match &events[0] {
            ApplicationEvent::LocalChange { except, .. } => {
                assert_eq!(except.as_deref(), Some("peer-b"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn status_monotonicity_drops_older_updates() {
        let dir = tempfile::tempdir().unwrap();
        let hub = EventHub::new();

        let gateway = DatabaseGateway::new(
            hub.clone(),
            Box::new(FakeFactory { pk: "id".into() }),
            vec![],
            HashSet::new(),
            dir.path().join("database.json"),
        )
        .await
        .unwrap();
        gateway.tick().await.unwrap();

        let newer = Status {
            sender: "B".into(),
            table: "users".into(),
            id: "u1".into(),
            date: 1000,
            status: StatusKind::Successful,
            message: None,
        };
        gateway.apply_status(&newer).await.unwrap();

        let older = Status {
            date: 500,
            status: StatusKind::Error,
            message: Some("boom".into()),
            ..newer.clone()
        };
        gateway.apply_status(&older).await.unwrap();

        let stored = {
            let mut guard = gateway.conn.lock().await;
            let conn = guard.as_mut().unwrap();
            conn.status_date(&newer.status_id()).await.unwrap()
        };
        assert_eq!(stored, Some(1000));
    }
}
