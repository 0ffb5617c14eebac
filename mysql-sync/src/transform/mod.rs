//! Looks up the per-table transformer (if any) and applies it once per
//! configured peer on the outbound path, and once on the inbound path.
//! Absence of a transformer file is cached as `None`, a legitimate
//! cached value.

pub mod error;
pub mod plugin;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

pub use error::Error;
use plugin::Transformer;

use crate::db::Entity;
use crate::hub::{ApplicationEvent, Change, DatabaseChangeError, EventHub, Listener, PeerName};
use crate::util::{camel_case, now_millis};

pub struct TransformStage {
    hub: Arc<EventHub>,
    self_name: PeerName,
    peers: Vec<PeerName>,
    transformer_dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, Option<Arc<Transformer>>>>,
}

impl TransformStage {
    pub fn new(hub: Arc<EventHub>, self_name: PeerName, peers: Vec<PeerName>, transformer_dir: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            hub,
            self_name,
            peers,
            transformer_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve (and cache) the transformer for `table`, if any: table
    /// name -> camelCase -> file lookup.
    fn transformer_for(&self, table: &str) -> Result<Option<Arc<Transformer>>, Error> {
        if let Some(cached) = self.cache.lock().get(table).cloned() {
            return Ok(cached);
        }

        let resolved = match &self.transformer_dir {
            Some(dir) => Transformer::load(dir, &camel_case(table))?.map(Arc::new),
            None => None,
        };

        self.cache.lock().insert(table.to_string(), resolved.clone());
        Ok(resolved)
    }

    fn transform(
        &self,
        table: &str,
        id: &str,
        entity: Option<&Entity>,
        source: &str,
        target: &str,
    ) -> Result<Option<Entity>, Error> {
        match self.transformer_for(table)? {
            Some(transformer) => transformer.call(source, target, table, id, entity),
            None => Ok(entity.cloned()),
        }
    }

    async fn handle_local_change(
        &self,
        table: &str,
        id: &str,
        entity: Option<&Entity>,
        except: Option<&str>,
    ) -> Result<(), Error> {
        for peer in &self.peers {
            if Some(peer.as_str()) == except {
                continue;
            }

            let transformed = match self.transform(table, id, entity, &self.self_name, peer) {
                Ok(transformed) => transformed,
                Err(err) => {
                    warn!(%err, table, peer, "outbound transformer failed");
                    let change = Change {
                        sender: self.self_name.clone(),
                        table: table.to_string(),
                        id: id.to_string(),
                        date: now_millis(),
                        entity: entity.cloned(),
                    };
                    self.fail(&change, &err.to_string()).await?;
                    continue;
                }
            };

            self.hub
                .emit(ApplicationEvent::RemoteSendChange {
                    table: table.to_string(),
                    id: id.to_string(),
                    entity: transformed,
                    peer: peer.clone(),
                })
                .await?;
        }
        Ok(())
    }

    async fn handle_remote_change(&self, change: &Change) -> Result<(), Error> {
        let transformed = match self.transform(
            &change.table,
            &change.id,
            change.entity.as_ref(),
            &change.sender,
            &self.self_name,
        ) {
            Ok(transformed) => transformed,
            Err(err) => {
                warn!(%err, table = %change.table, sender = %change.sender, "inbound transformer failed");
                return self.fail(change, &err.to_string()).await;
            }
        };

        self.hub
            .emit(ApplicationEvent::LocalSaveChange(Change {
                entity: transformed,
                ..change.clone()
            }))
            .await?;

        Ok(())
    }

    /// Surface a transformer failure the same way the Database Gateway
    /// surfaces an apply failure: as a `local-save-failed` event, so the
    /// originating peer gets an `error` info reply and a `sync_status`
    /// row instead of the failure silently vanishing.
    async fn fail(&self, change: &Change, message: &str) -> Result<(), Error> {
        self.hub
            .emit(ApplicationEvent::LocalSaveFailed(DatabaseChangeError {
                change: change.clone(),
                message: message.to_string(),
            }))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Listener for TransformStage {
    async fn handle(&self, event: &ApplicationEvent) -> Result<(), crate::hub::Error> {
        let result = match event {
            ApplicationEvent::LocalChange {
                table,
                id,
                entity,
                except,
            } => {
                self.handle_local_change(table, id, entity.as_ref(), except.as_deref())
                    .await
            }
            ApplicationEvent::RemoteChange(change) => self.handle_remote_change(change).await,
            _ => Ok(()),
        };

        result.map_err(|e| crate::hub::Error::Listener(event.kind(), e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hub::EventKind;
    use std::sync::Mutex as SyncMutex;

    struct Recorder(Arc<SyncMutex<Vec<ApplicationEvent>>>);

    #[async_trait]
    impl Listener for Recorder {
        async fn handle(&self, event: &ApplicationEvent) -> Result<(), crate::hub::Error> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn local_change_fans_out_to_every_peer_except_sender() {
        let hub = EventHub::new();
        let record = Arc::new(SyncMutex::new(Vec::new()));
        hub.on(EventKind::RemoteSendChange, Arc::new(Recorder(record.clone())));

        let stage = TransformStage::new(
            hub.clone(),
            "node-a".into(),
            vec!["node-b".into(), "node-c".into()],
            None,
        );

        hub.on(EventKind::LocalChange, stage.clone());

        hub.emit(ApplicationEvent::LocalChange {
            table: "users".into(),
            id: "u1".into(),
            entity: None,
            except: Some("node-b".into()),
        })
        .await
        .unwrap();

        let events = record.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ApplicationEvent::RemoteSendChange { peer, .. } => assert_eq!(peer, "node-c"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn remote_change_without_transformer_passes_entity_through() {
        let hub = EventHub::new();
        let record = Arc::new(SyncMutex::new(Vec::new()));
        hub.on(EventKind::LocalSaveChange, Arc::new(Recorder(record.clone())));

        let stage = TransformStage::new(hub.clone(), "node-a".into(), vec![], None);
        hub.on(EventKind::RemoteChange, stage.clone());

        let mut entity = Entity::new();
        entity.insert("id".into(), serde_json::Value::String("u1".into()));

        let change = Change {
            sender: "node-b".into(),
            table: "users".into(),
            id: "u1".into(),
            date: 1000,
            entity: Some(entity.clone()),
        };
        hub.emit(ApplicationEvent::RemoteChange(change.clone()))
            .await
            .unwrap();

        let events = record.lock().unwrap();
        match &events[0] {
            ApplicationEvent::LocalSaveChange(saved) => assert_eq!(saved.entity, Some(entity)),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_transformer_directory_is_cached_as_none() {
        let hub = EventHub::new();
        let stage = TransformStage::new(hub, "node-a".into(), vec![], None);

        assert!(stage.transformer_for("users").unwrap().is_none());
        assert!(stage.cache.lock().contains_key("users"));
    }
}
