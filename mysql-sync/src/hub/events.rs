use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::Error as DbError;

pub type TableName = String;
pub type PeerName = String;
pub type RowId = String;
pub type EpochMillis = i64;

/// A captured row mutation. `entity = None` denotes a delete.
///
/// `id` must equal `entity[primaryKey]` when both are present; enforced
/// by the Database Gateway before apply, not by this type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Change {
    pub sender: PeerName,
    pub table: TableName,
    pub id: RowId,
    pub date: EpochMillis,
    pub entity: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Successful,
    Pending,
    Error,
}

/// A durable per-(table, id, peer) record of the last known replication
/// outcome, persisted in `sync_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Status {
    pub sender: PeerName,
    pub table: TableName,
    pub id: RowId,
    pub date: EpochMillis,
    pub status: StatusKind,
    pub message: Option<String>,
}

impl Status {
    /// `md5(table + '-' + id + '-' + sender)`, lowercase hex.
    pub fn status_id(&self) -> String {
        crate::util::status_id(&self.table, &self.id, &self.sender)
    }
}

/// Information about a successfully applied change, used to notify the
/// originating peer.
#[derive(Debug, Clone)]
pub struct DatabaseChangeInfo {
    pub change: Change,
}

/// Information about a failed apply attempt, carrying the reason that is
/// both logged and relayed to the originating peer as an `error` info
/// message.
#[derive(Debug, Clone)]
pub struct DatabaseChangeError {
    pub change: Change,
    pub message: String,
}

/// The canonical event set wired through the Event Hub.
#[derive(Debug, Clone)]
pub enum ApplicationEvent {
    DatabaseConnect,
    DatabaseDisconnect,
    DatabaseError(DbErrorPayload),
    LocalChange {
        table: TableName,
        id: RowId,
        entity: Option<BTreeMap<String, serde_json::Value>>,
        except: Option<PeerName>,
    },
    LocalSaveChange(Change),
    LocalSaveSuccessful(DatabaseChangeInfo),
    LocalSaveFailed(DatabaseChangeError),
    RemoteChange(Change),
    RemoteSendChange {
        table: TableName,
        id: RowId,
        entity: Option<BTreeMap<String, serde_json::Value>>,
        peer: PeerName,
    },
    RemoteStatusChange(Status),
}

/// A cheap, `Copy` discriminant used to key the listener registry so
/// listeners don't have to match on the full payload just to find out
/// which event fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DatabaseConnect,
    DatabaseDisconnect,
    DatabaseError,
    LocalChange,
    LocalSaveChange,
    LocalSaveSuccessful,
    LocalSaveFailed,
    RemoteChange,
    RemoteSendChange,
    RemoteStatusChange,
}

impl ApplicationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ApplicationEvent::DatabaseConnect => EventKind::DatabaseConnect,
            ApplicationEvent::DatabaseDisconnect => EventKind::DatabaseDisconnect,
            ApplicationEvent::DatabaseError(_) => EventKind::DatabaseError,
            ApplicationEvent::LocalChange { .. } => EventKind::LocalChange,
            ApplicationEvent::LocalSaveChange(_) => EventKind::LocalSaveChange,
            ApplicationEvent::LocalSaveSuccessful(_) => EventKind::LocalSaveSuccessful,
            ApplicationEvent::LocalSaveFailed(_) => EventKind::LocalSaveFailed,
            ApplicationEvent::RemoteChange(_) => EventKind::RemoteChange,
            ApplicationEvent::RemoteSendChange { .. } => EventKind::RemoteSendChange,
            ApplicationEvent::RemoteStatusChange(_) => EventKind::RemoteStatusChange,
        }
    }
}

/// `DbError` isn't `Clone` (it wraps driver errors); the hub only needs
/// to move it once to whichever listener logs/reports it, so we carry
/// its rendered message instead of the error itself.
#[derive(Debug, Clone)]
pub struct DbErrorPayload(pub String);

impl From<&DbError> for DbErrorPayload {
    fn from(err: &DbError) -> Self {
        DbErrorPayload(err.to_string())
    }
}
