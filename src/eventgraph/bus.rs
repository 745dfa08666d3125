use super::{Event, EventStore, NewEvent, StoreResult};
use crate::util::BoxFuture;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// Live feed of appended events. Slow subscribers silently skip what they
/// missed; the log itself stays the source of truth.
pub type EventSubscription = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Store wrapper that publishes every successful append.
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn EventStore>,
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(store: Arc<dyn EventStore>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { store, sender }
    }

    pub fn subscribe(&self) -> EventSubscription {
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(std::result::Result::ok);
        Box::pin(stream)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventStore for EventBus {
    fn append(&self, event: NewEvent) -> BoxFuture<'_, StoreResult<Event>> {
        Box::pin(async move {
            let stored = self.store.append(event).await?;
            // No subscribers is not an error.
            let _ = self.sender.send(stored.clone());
            Ok(stored)
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Option<Event>>> {
        self.store.get(id)
    }

    fn recent(&self, limit: usize) -> BoxFuture<'_, StoreResult<Vec<Event>>> {
        self.store.recent(limit)
    }

    fn by_type<'a>(
        &'a self,
        event_type: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        self.store.by_type(event_type, limit)
    }

    fn by_source<'a>(
        &'a self,
        source: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        self.store.by_source(source, limit)
    }

    fn by_conversation<'a>(
        &'a self,
        conversation_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        self.store.by_conversation(conversation_id, limit)
    }

    fn since<'a>(
        &'a self,
        after_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        self.store.since(after_id, limit)
    }

    fn ancestors<'a>(
        &'a self,
        id: &'a str,
        max_depth: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        self.store.ancestors(id, max_depth)
    }

    fn descendants<'a>(
        &'a self,
        id: &'a str,
        max_depth: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        self.store.descendants(id, max_depth)
    }

    fn search<'a>(
        &'a self,
        query: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, StoreResult<Vec<Event>>> {
        self.store.search(query, limit)
    }

    fn verify_chain(&self) -> BoxFuture<'_, StoreResult<usize>> {
        self.store.verify_chain()
    }

    fn count(&self) -> BoxFuture<'_, StoreResult<u64>> {
        self.store.count()
    }

    fn distinct_types(&self) -> BoxFuture<'_, StoreResult<Vec<String>>> {
        self.store.distinct_types()
    }

    fn distinct_sources(&self) -> BoxFuture<'_, StoreResult<Vec<String>>> {
        self.store.distinct_sources()
    }
}
