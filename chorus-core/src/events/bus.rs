use std::{
    collections::HashMap,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;

use super::{DomainEvent, EventEnvelope, EventKind, EventMeta};
use crate::{config::EventBusConfig, util::panic_message};

/// Consumer of domain events. Errors are logged by the bus and never reach
/// the publisher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnEventHandler<F> {
    name: String,
    f: F,
}

impl<F> FnEventHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> fmt::Debug for FnEventHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnEventHandler")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnEventHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    name: String,
    tx: mpsc::UnboundedSender<Arc<EventEnvelope>>,
}

#[derive(Default)]
struct SubscriberTable {
    sequence: u64,
    by_kind: HashMap<EventKind, Vec<Arc<Subscription>>>,
}

/// Wait-group over delivered-but-unhandled events.
#[derive(Default)]
struct DeliveryTracker {
    in_flight: AtomicUsize,
    idle: Notify,
}

impl DeliveryTracker {
    fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn complete(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct BusInner {
    table: Mutex<SubscriberTable>,
    tracker: Arc<DeliveryTracker>,
    next_subscription: AtomicU64,
    tap: broadcast::Sender<Arc<EventEnvelope>>,
    tap_capacity: usize,
}

/// In-process publish/subscribe dispatcher.
///
/// Every subscription owns a delivery task fed by an unbounded FIFO channel,
/// so a handler sees events in publish order while different handlers run in
/// parallel. `publish` never waits for handlers; [`EventBus::wait_idle`] acts
/// as the wait-group for callers that need delivery to have finished.
/// Subscribing spawns onto the current tokio runtime.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.inner.table.lock();
        let subscriptions: usize = table.by_kind.values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("sequence", &table.sequence)
            .field("subscriptions", &subscriptions)
            .field("in_flight", &self.in_flight())
            .field("tap_capacity", &self.inner.tap_capacity)
            .field("tap_subscribers", &self.inner.tap.receiver_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&EventBusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: &EventBusConfig) -> Self {
        let capacity = config.tap_capacity.max(1);
        let (tap, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                table: Mutex::new(SubscriberTable::default()),
                tracker: Arc::new(DeliveryTracker::default()),
                next_subscription: AtomicU64::new(1),
                tap,
                tap_capacity: capacity,
            }),
        }
    }

    /// Delivers `event` to every handler subscribed to its kind and to the
    /// broadcast tap. Returns the metadata assigned to it.
    pub fn publish(&self, event: DomainEvent) -> EventMeta {
        let kind = event.kind();
        let mut table = self.inner.table.lock();
        table.sequence += 1;
        let meta = EventMeta {
            sequence: table.sequence,
            published_at: Utc::now(),
        };
        let envelope = Arc::new(EventEnvelope { meta, event });

        let mut delivered = 0usize;
        if let Some(subscriptions) = table.by_kind.get(&kind) {
            for subscription in subscriptions {
                self.inner.tracker.begin();
                if subscription.tx.send(Arc::clone(&envelope)).is_err() {
                    self.inner.tracker.complete();
                    tracing::debug!(
                        target: "events::bus",
                        handler = %subscription.name,
                        event = %kind,
                        "subscription closed before delivery"
                    );
                } else {
                    delivered += 1;
                }
            }
        }
        let _ = self.inner.tap.send(envelope);
        drop(table);

        tracing::trace!(
            target: "events::bus",
            event = %kind,
            sequence = meta.sequence,
            delivered,
            "event published"
        );
        meta
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        self.subscribe_many([kind], handler)
    }

    /// Registers one handler for several kinds behind a single ordered
    /// stream, so it observes all of them in publish order.
    pub fn subscribe_many<I>(
        &self,
        kinds: I,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId
    where
        I: IntoIterator<Item = EventKind>,
    {
        let id = SubscriptionId(
            self.inner.next_subscription.fetch_add(1, Ordering::Relaxed),
        );
        let name = handler.name().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Arc::new(Subscription {
            id,
            name: name.clone(),
            tx,
        });

        let mut kinds: Vec<EventKind> = kinds.into_iter().collect();
        kinds.sort();
        kinds.dedup();

        {
            let mut table = self.inner.table.lock();
            for kind in &kinds {
                table
                    .by_kind
                    .entry(*kind)
                    .or_default()
                    .push(Arc::clone(&subscription));
            }
        }

        tracing::debug!(
            target: "events::bus",
            handler = %name,
            kinds = ?kinds,
            "handler subscribed"
        );

        tokio::spawn(deliver(
            handler,
            name,
            rx,
            Arc::clone(&self.inner.tracker),
        ));
        id
    }

    /// Removes a subscription. Events already queued for it are still
    /// handled. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut table = self.inner.table.lock();
        let mut removed = false;
        for subscriptions in table.by_kind.values_mut() {
            let before = subscriptions.len();
            subscriptions.retain(|subscription| subscription.id != id);
            removed |= subscriptions.len() != before;
        }
        table.by_kind.retain(|_, subscriptions| !subscriptions.is_empty());
        removed
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .table
            .lock()
            .by_kind
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Number of delivered events whose handler has not finished.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.in_flight.load(Ordering::Acquire)
    }

    /// Resolves once every delivered event has been handled, including
    /// events published by handlers along the way.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.tracker.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Raw receiver over every published event. Lagging receivers skip.
    pub fn tap(&self) -> broadcast::Receiver<Arc<EventEnvelope>> {
        self.inner.tap.subscribe()
    }

    /// Stream form of [`EventBus::tap`] for long-poll connectors.
    pub fn stream(&self) -> BroadcastStream<Arc<EventEnvelope>> {
        BroadcastStream::new(self.tap())
    }
}

async fn deliver(
    handler: Arc<dyn EventHandler>,
    name: String,
    mut rx: mpsc::UnboundedReceiver<Arc<EventEnvelope>>,
    tracker: Arc<DeliveryTracker>,
) {
    while let Some(envelope) = rx.recv().await {
        let outcome = AssertUnwindSafe(handler.handle(&envelope))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(
                    target: "events::bus",
                    handler = %name,
                    event = %envelope.kind(),
                    sequence = envelope.meta.sequence,
                    error = %format!("{err:#}"),
                    "event handler failed"
                );
            }
            Err(panic) => {
                tracing::error!(
                    target: "events::bus",
                    handler = %name,
                    event = %envelope.kind(),
                    sequence = envelope.meta.sequence,
                    panic = %panic_message(panic.as_ref()),
                    "event handler panicked"
                );
            }
        }
        tracker.complete();
    }
    tracing::debug!(target: "events::bus", handler = %name, "delivery task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ids::ArtistId;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Default)]
    struct Recorder {
        seen: TokioMutex<Vec<u64>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()> {
            self.seen.lock().await.push(event.meta.sequence);
            Ok(())
        }
    }

    struct Exploding;

    #[async_trait]
    impl EventHandler for Exploding {
        async fn handle(&self, _event: &EventEnvelope) -> anyhow::Result<()> {
            panic!("handler blew up");
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &EventEnvelope) -> anyhow::Result<()> {
            anyhow::bail!("refused")
        }
    }

    fn artist_updated(id: i64) -> DomainEvent {
        DomainEvent::ArtistUpdated {
            artist_id: ArtistId(id),
        }
    }

    #[tokio::test]
    async fn handler_sees_events_in_publish_order() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(EventKind::ArtistUpdated, recorder.clone());

        let published: Vec<u64> = (0..50)
            .map(|i| bus.publish(artist_updated(i)).sequence)
            .collect();
        bus.wait_idle().await;

        assert_eq!(*recorder.seen.lock().await, published);
    }

    #[tokio::test]
    async fn only_matching_kinds_are_delivered() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(EventKind::ArtistDeleted, recorder.clone());

        bus.publish(artist_updated(1));
        bus.wait_idle().await;

        assert!(recorder.seen.lock().await.is_empty());
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_do_not_block_others() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(EventKind::ArtistUpdated, Arc::new(Exploding));
        bus.subscribe(EventKind::ArtistUpdated, Arc::new(Failing));
        bus.subscribe(EventKind::ArtistUpdated, recorder.clone());

        bus.publish(artist_updated(1));
        bus.publish(artist_updated(2));
        bus.wait_idle().await;

        assert_eq!(recorder.seen.lock().await.len(), 2);
        assert_eq!(bus.in_flight(), 0);
    }

    #[tokio::test]
    async fn unsubscribed_handlers_stop_receiving() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder::default());
        let id = bus.subscribe(EventKind::ArtistUpdated, recorder.clone());

        bus.publish(artist_updated(1));
        bus.wait_idle().await;
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(artist_updated(2));
        bus.wait_idle().await;

        assert_eq!(recorder.seen.lock().await.len(), 1);
        assert_eq!(bus.subscriber_count(EventKind::ArtistUpdated), 0);
    }

    #[tokio::test]
    async fn tap_receives_every_event() {
        let bus = EventBus::default();
        let mut tap = bus.tap();

        bus.publish(artist_updated(1));
        bus.publish(DomainEvent::ConfigSaved);

        let first = tap.recv().await.expect("first event");
        let second = tap.recv().await.expect("second event");
        assert_eq!(first.kind(), EventKind::ArtistUpdated);
        assert_eq!(second.kind(), EventKind::ConfigSaved);
        assert!(first.meta.sequence < second.meta.sequence);
    }

    #[tokio::test]
    async fn closure_handlers_can_publish_follow_up_events() {
        let bus = EventBus::default();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(EventKind::ConfigSaved, recorder.clone());

        let relay_bus = bus.clone();
        bus.subscribe(
            EventKind::ArtistUpdated,
            Arc::new(FnEventHandler::new("relay", move |_event: EventEnvelope| {
                let bus = relay_bus.clone();
                async move {
                    bus.publish(DomainEvent::ConfigSaved);
                    Ok(())
                }
            })),
        );

        bus.publish(artist_updated(1));
        bus.wait_idle().await;

        assert_eq!(recorder.seen.lock().await.len(), 1);
    }
}
