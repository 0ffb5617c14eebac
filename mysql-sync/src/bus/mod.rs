//! Owns the MQTT client exclusively. Connects, subscribes to the three
//! topics the node cares about, tracks peer presence, and buffers
//! outbound messages per peer while that peer is offline.

pub mod error;
pub mod wire;

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS, TlsConfiguration, Transport,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use mysql_sync_config::BusConfig;

pub use error::Error;
use wire::{Change, InfoBody, InfoMessage};

use crate::hub::{
    ApplicationEvent, DatabaseChangeError, DatabaseChangeInfo, EventHub, Listener, PeerName,
    Status, StatusKind,
};
use crate::queue::FileQueue;
use crate::util::now_millis;

const WILL_TOPIC: &str = "/info";
const PRESENCE_TOPIC: &str = "/info";

fn change_topic(peer: &str) -> String {
    format!("/change/{peer}")
}

fn info_topic(peer: &str) -> String {
    format!("/info/{peer}")
}

/// An outbound message buffered for a peer that is currently offline
/// while the peer is offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct QueuedPublish {
    topic: String,
    payload: serde_json::Value,
}

pub struct BusGateway {
    hub: Arc<EventHub>,
    client: AsyncClient,
    self_name: PeerName,
    update_interval_ms: i64,
    receive_tables: HashSet<String>,
    presence: Mutex<HashMap<PeerName, i64>>,
    next_active_update: AtomicI64,
    peer_queues: Mutex<HashMap<PeerName, Arc<FileQueue<QueuedPublish>>>>,
    queue_dir: PathBuf,
    incoming_store: FileQueue<QueuedPublish>,
    outgoing_store: FileQueue<QueuedPublish>,
}

impl BusGateway {
    /// Connect to the bus, subscribe to `/info`, `/info/<self>` and
    /// `/change/<self>`, and spawn the background dispatch loop
    /// loop.
    pub async fn connect(
        config: &BusConfig,
        self_name: PeerName,
        update_interval_ms: i64,
        receive_tables: HashSet<String>,
        queue_dir: impl AsRef<Path>,
        hub: Arc<EventHub>,
    ) -> Result<Arc<Self>, Error> {
        let queue_dir = queue_dir.as_ref().to_path_buf();

        let mut opts = MqttOptions::new(self_name.clone(), config.host.clone(), config.port);
        opts.set_keep_alive(std::time::Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }

        let will_payload = serde_json::to_vec(&InfoMessage::connection_lost(self_name.clone()))
            .expect("InfoMessage always serializes");
        opts.set_last_will(LastWill::new(WILL_TOPIC, will_payload, QoS::AtLeastOnce, false));

        if config.tls_enabled() {
            let client_auth = if !config.cert_bytes.is_empty() && !config.key_bytes.is_empty() {
                Some((config.cert_bytes.clone(), config.key_bytes.clone()))
            } else {
                None
            };
            opts.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: config.ca_bytes.clone(),
                alpn: None,
                client_auth,
            }));
        }

        let (client, eventloop) = AsyncClient::new(opts, 256);

        client
            .subscribe("/info", QoS::AtLeastOnce)
            .await?;
        client
            .subscribe(info_topic(&self_name), QoS::AtLeastOnce)
            .await?;
        client
            .subscribe(change_topic(&self_name), QoS::AtLeastOnce)
            .await?;

        let incoming_store = FileQueue::open(queue_dir.join("mqtt-incoming.json")).await?;
        let outgoing_store = FileQueue::open(queue_dir.join("mqtt-outgoing.json")).await?;

        let gateway = Arc::new(Self {
            hub,
            client,
            self_name,
            update_interval_ms,
            receive_tables,
            presence: Mutex::new(HashMap::new()),
            next_active_update: AtomicI64::new(0),
            peer_queues: Mutex::new(HashMap::new()),
            queue_dir,
            incoming_store,
            outgoing_store,
        });

        tokio::spawn(run_event_loop(gateway.clone(), eventloop));

        Ok(gateway)
    }

    /// Presence protocol: publish `connected` once the grace period has
    /// elapsed. `until` gives peers a deadline beyond the next expected
    /// update, so a couple of missed ticks don't look like a drop.
    pub async fn tick(&self) -> Result<(), Error> {
        let now = now_millis();
        if now < self.next_active_update.load(Ordering::Relaxed) {
            return Ok(());
        }

        let until = now + 2 * self.update_interval_ms + 2000;
        let message = InfoMessage::connected(self.self_name.clone(), until);
        self.publish_raw(PRESENCE_TOPIC, &message).await?;

        self.next_active_update
            .store(now + self.update_interval_ms + 2000, Ordering::Relaxed);
        Ok(())
    }

    fn peer_connected(&self, peer: &str) -> bool {
        match self.presence.lock().get(peer) {
            Some(expiry) => now_millis() < *expiry,
            None => false,
        }
    }

    fn peer_queue_sync(&self, peer: &str) -> Option<Arc<FileQueue<QueuedPublish>>> {
        self.peer_queues.lock().get(peer).cloned()
    }

    async fn peer_queue(&self, peer: &str) -> Result<Arc<FileQueue<QueuedPublish>>, Error> {
        if let Some(queue) = self.peer_queue_sync(peer) {
            return Ok(queue);
        }
        let path = self.queue_dir.join(format!("remote-{peer}.json"));
        let queue = Arc::new(FileQueue::open(path).await?);
        self.peer_queues.lock().insert(peer.to_string(), queue.clone());
        Ok(queue)
    }

    /// Publish to `topic`, buffering to the peer's durable queue instead
    /// when the named peer isn't presently connected.
    pub async fn publish(
        &self,
        topic: &str,
        payload: &impl Serialize,
        remote_peer: Option<&str>,
    ) -> Result<(), Error> {
        if let Some(peer) = remote_peer {
            if !self.peer_connected(peer) {
                let queue = self.peer_queue(peer).await?;
                let value = serde_json::to_value(payload)?;
                queue
                    .push(QueuedPublish {
                        topic: topic.to_string(),
                        payload: value,
                    })
                    .await?;
                debug!(peer, topic, "peer offline, buffered publish");
                return Ok(());
            }
        }

        self.publish_raw(topic, payload).await
    }

    async fn publish_raw(&self, topic: &str, payload: &impl Serialize) -> Result<(), Error> {
        let value = serde_json::to_value(payload)?;
        let encoded = serde_json::to_vec(&value)?;

        let record = QueuedPublish {
            topic: topic.to_string(),
            payload: value,
        };
        self.outgoing_store.push(record.clone()).await?;

        self.client.publish(topic, QoS::AtLeastOnce, false, encoded).await?;

        // rumqttc's publish() resolves once the request reaches the
        // event loop's internal channel, not once the broker acks it;
        // full pkid->PubAck correlation is a documented simplification
        // (DESIGN.md) given the durable queue already replays on crash.
        self.outgoing_store
            .delete(|item| item.topic == record.topic && item.payload == record.payload)
            .await?;

        Ok(())
    }

    /// Drain a peer's offline queue in order, stopping the moment its
    /// presence lapses.
    async fn drain_peer_queue(&self, peer: &str) -> Result<(), Error> {
        let queue = self.peer_queue(peer).await?;
        while self.peer_connected(peer) {
            let Some(item) = queue.poll().await? else {
                break;
            };
            debug!(peer, topic = %item.topic, "draining buffered publish");
            self.publish_raw(&item.topic, &item.payload).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<(), Error> {
        let record = QueuedPublish {
            topic: topic.to_string(),
            payload: serde_json::from_slice(payload).unwrap_or(serde_json::Value::Null),
        };
        self.incoming_store.push(record.clone()).await?;

        self.dispatch_inner(topic, payload).await;

        self.incoming_store
            .delete(|item| item.topic == record.topic && item.payload == record.payload)
            .await?;
        Ok(())
    }

    async fn dispatch_inner(&self, topic: &str, payload: &[u8]) {
        if topic == change_topic(&self.self_name) {
            self.dispatch_change(payload).await;
        } else if topic == "/info" || topic == info_topic(&self.self_name) {
            self.dispatch_info(payload).await;
        } else {
            warn!(topic, "unexpected inbound topic");
        }
    }

    async fn dispatch_change(&self, payload: &[u8]) {
        let change: Change = match serde_json::from_slice(payload) {
            Ok(change) => change,
            Err(err) => {
                warn!(%err, "dropping malformed /change payload");
                return;
            }
        };

        if change.sender == self.self_name {
            return;
        }

        if !self.receive_tables.contains(&change.table) {
            let info = InfoMessage::error(
                self.self_name.clone(),
                change.table.clone(),
                change.id.clone(),
                change.date,
                format!("table \"{}\" is not in receiveTables", change.table),
            );
            if let Err(err) = self
                .publish(&info_topic(&change.sender), &info, Some(&change.sender))
                .await
            {
                warn!(%err, "failed to publish receive-table-violation error");
            }
            return;
        }

        if let Err(err) = self.hub.emit(ApplicationEvent::RemoteChange(change)).await {
            warn!(%err, "remote-change listener failed");
        }
    }

    async fn dispatch_info(&self, payload: &[u8]) {
        let message: InfoMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "dropping malformed /info payload");
                return;
            }
        };

        if message.sender == self.self_name {
            return;
        }

        match message.body {
            InfoBody::Connected { args } => {
                self.presence.lock().insert(message.sender.clone(), args.until);
                if let Err(err) = self.drain_peer_queue(&message.sender).await {
                    warn!(%err, peer = %message.sender, "failed draining peer queue");
                }
            }
            InfoBody::ConnectionLost { .. } => {
                self.presence.lock().remove(&message.sender);
            }
            InfoBody::DataReceived { args } => {
                let status = Status {
                    sender: message.sender,
                    table: args.table,
                    id: args.id,
                    date: args.date,
                    status: StatusKind::Successful,
                    message: None,
                };
                if let Err(err) = self.hub.emit(ApplicationEvent::RemoteStatusChange(status)).await {
                    warn!(%err, "remote-status-change listener failed");
                }
            }
            InfoBody::Error { args } => {
                let status = Status {
                    sender: message.sender,
                    table: args.table,
                    id: args.id,
                    date: args.date,
                    status: StatusKind::Error,
                    message: Some(args.message),
                };
                if let Err(err) = self.hub.emit(ApplicationEvent::RemoteStatusChange(status)).await {
                    warn!(%err, "remote-status-change listener failed");
                }
            }
        }
    }
}

async fn run_event_loop(gateway: Arc<BusGateway>, mut eventloop: rumqttc::EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let topic = publish.topic.clone();
                let payload = publish.payload.to_vec();
                gateway.dispatch(&topic, &payload).await;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(%err, "mqtt event loop error, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
            }
        }
    }
}

#[async_trait]
impl Listener for BusGateway {
    async fn handle(&self, event: &ApplicationEvent) -> Result<(), crate::hub::Error> {
        let result = match event {
            ApplicationEvent::RemoteSendChange {
                table,
                id,
                entity,
                peer,
            } => {
                let change = Change {
                    sender: self.self_name.clone(),
                    table: table.clone(),
                    id: id.clone(),
                    date: now_millis(),
                    entity: entity.clone(),
                };
                self.publish(&change_topic(peer), &change, Some(peer)).await
            }
            ApplicationEvent::LocalSaveSuccessful(DatabaseChangeInfo { change }) => {
                let info = InfoMessage::data_received(
                    self.self_name.clone(),
                    change.table.clone(),
                    change.id.clone(),
                    change.date,
                );
                self.publish(&info_topic(&change.sender), &info, Some(&change.sender))
                    .await
            }
            ApplicationEvent::LocalSaveFailed(DatabaseChangeError { change, message }) => {
                let info = InfoMessage::error(
                    self.self_name.clone(),
                    change.table.clone(),
                    change.id.clone(),
                    change.date,
                    message.clone(),
                );
                self.publish(&info_topic(&change.sender), &info, Some(&change.sender))
                    .await
            }
            _ => Ok(()),
        };

        result.map_err(|e| crate::hub::Error::Listener(event.kind(), e.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn change_and_info_topics_are_scoped_to_peer() {
        assert_eq!(change_topic("node-b"), "/change/node-b");
        assert_eq!(info_topic("node-b"), "/info/node-b");
    }
}
