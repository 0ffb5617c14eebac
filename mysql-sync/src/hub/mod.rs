//! A named, ordered, asynchronous event bus.
//!
//! An [`EventHub`] is constructed once in `main` and handed (via `Arc`)
//! to every component constructor. Components never call each other
//! directly; they only emit [`ApplicationEvent`]s and register
//! [`Listener`]s.

pub mod events;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

pub use events::{
    ApplicationEvent, Change, DatabaseChangeError, DatabaseChangeInfo, DbErrorPayload, EpochMillis,
    EventKind, PeerName, RowId, Status, StatusKind, TableName,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("listener for {0:?} failed: {1}")]
    Listener(EventKind, String),
}

/// A single subscriber to one kind of [`ApplicationEvent`].
///
/// Implementors run to completion before the hub dispatches the event
/// to the next registered listener.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn handle(&self, event: &ApplicationEvent) -> Result<(), Error>;
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<EventKind, Vec<Arc<dyn Listener>>>,
}

/// The event hub. Cheap to clone (wraps an `Arc` internally via
/// `EventHub::shared`); typically constructed once and shared.
pub struct EventHub {
    registry: Mutex<Registry>,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::default()),
        })
    }

    /// Register a listener for one event kind. Registration order
    /// determines dispatch order.
    pub fn on(&self, kind: EventKind, listener: Arc<dyn Listener>) {
        self.registry
            .lock()
            .listeners
            .entry(kind)
            .or_default()
            .push(listener);
    }

    /// Emit an event. Resolves only once every registered listener for
    /// this event's kind has resolved; the first listener error is
    /// propagated to the caller and dispatch to subsequent listeners is
    /// abandoned.
    pub async fn emit(&self, event: ApplicationEvent) -> Result<(), Error> {
        let kind = event.kind();
        let listeners = {
            let registry = self.registry.lock();
            registry.listeners.get(&kind).cloned().unwrap_or_default()
        };

        for listener in listeners {
            listener.handle(&event).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl Listener for Counter {
        async fn handle(&self, _event: &ApplicationEvent) -> Result<(), Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Recorder(Arc<Mutex<Vec<&'static str>>>, &'static str);

    #[async_trait]
    impl Listener for Recorder {
        async fn handle(&self, _event: &ApplicationEvent) -> Result<(), Error> {
            self.0.lock().push(self.1);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Listener for Failing {
        async fn handle(&self, _event: &ApplicationEvent) -> Result<(), Error> {
            Err(Error::Listener(EventKind::DatabaseConnect, "boom".into()))
        }
    }

    #[tokio::test]
    async fn dispatches_only_to_matching_kind() {
        let hub = EventHub::new();
        let count = Arc::new(AtomicUsize::new(0));
        hub.on(
            EventKind::DatabaseConnect,
            Arc::new(Counter(count.clone())),
        );

        hub.emit(ApplicationEvent::DatabaseDisconnect).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        hub.emit(ApplicationEvent::DatabaseConnect).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listeners_run_in_registration_order() {
        let hub = EventHub::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        hub.on(
            EventKind::DatabaseConnect,
            Arc::new(Recorder(order.clone(), "first")),
        );
        hub.on(
            EventKind::DatabaseConnect,
            Arc::new(Recorder(order.clone(), "second")),
        );

        hub.emit(ApplicationEvent::DatabaseConnect).await.unwrap();
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn listener_error_propagates_to_emitter() {
        let hub = EventHub::new();
        hub.on(EventKind::DatabaseConnect, Arc::new(Failing));

        let err = hub.emit(ApplicationEvent::DatabaseConnect).await;
        assert!(err.is_err());
    }
}
