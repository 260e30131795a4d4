//! Publish/subscribe over the events topic exchange.

use futures_util::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::connection::{message_handler, AckMode, Connection};
use crate::driver::{ChannelId, ExchangeKind, PublishProperties};
use crate::error::{BusError, Result};
use crate::listener::{Listener, ListenerOptions};
use crate::message::{IncomingEvent, MessageFactory};
use crate::trie::TopicRouter;

pub const EVENT_TOPIC_PREFIX: &str = "EVENT";

/// Topic an event of `event_type` is published under when none is given
pub fn default_topic(event_type: &str) -> String {
    format!("{}.{}", EVENT_TOPIC_PREFIX, event_type)
}

type EventHandlerFn = dyn Fn(IncomingEvent) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Shared async event callback. Two handlers are equal when they are clones of each other.
#[derive(Clone)]
pub struct EventHandler(Arc<EventHandlerFn>);

impl EventHandler {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(IncomingEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self(Arc::new(move |event| Box::pin(handler(event))))
    }

    pub async fn call(&self, event: IncomingEvent) -> Result<()> {
        (self.0)(event).await
    }
}

impl PartialEq for EventHandler {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.0) as *const (),
            Arc::as_ptr(&other.0) as *const (),
        )
    }
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventHandler({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// Publishes events on the events exchange
pub struct EventDispatcher {
    connection: Arc<Connection>,
    factory: MessageFactory,
    channel: Mutex<Option<ChannelId>>,
}

impl EventDispatcher {
    pub fn new(connection: Arc<Connection>, factory: MessageFactory) -> Self {
        Self {
            connection,
            factory,
            channel: Mutex::new(None),
        }
    }

    /// Open the channel and declare the events exchange. Idempotent.
    pub async fn init(&self) -> Result<()> {
        let mut channel = self.channel.lock().await;
        if channel.is_some() {
            return Ok(());
        }
        let opened = self.connection.open_channel().await?;
        let exchange = &self.connection.config().events_exchange_name;
        if let Err(e) = self
            .connection
            .declare_exchange(opened, exchange, ExchangeKind::Topic)
            .await
        {
            if let Err(close_error) = self.connection.close_channel(opened).await {
                warn!("Failed to close {}: {}", opened, close_error);
            }
            return Err(e);
        }
        *channel = Some(opened);
        Ok(())
    }

    /// Publish `content` as an `event_type` event under `topic`, or `EVENT.<event_type>`
    pub async fn publish(&self, event_type: &str, content: &Value, topic: Option<&str>) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(BusError::NotConnected);
        }
        let channel = (*self.channel.lock().await).ok_or(BusError::NotInitialized)?;

        let topic = topic.map(str::to_string).unwrap_or_else(|| default_topic(event_type));
        let payload = self.factory.build_event(event_type, content, &topic)?;
        let properties = PublishProperties::new(uuid::Uuid::new_v4().to_string()).persistent();

        self.connection
            .publish(
                channel,
                &self.connection.config().events_exchange_name,
                &topic,
                &payload,
                &properties,
            )
            .await?;
        debug!("Published event {} on {}", event_type, topic);
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(opened) = self.channel.lock().await.take() {
            self.connection.close_channel(opened).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher").finish_non_exhaustive()
    }
}

/// Late-ack listener on the events exchange.
///
/// Inbound events go to the catch-all handler, if any, and then to every
/// handler whose pattern matches the event's topic.
pub struct EventListener {
    listener: Listener,
    factory: MessageFactory,
    router: Arc<RwLock<TopicRouter<EventHandler>>>,
    all_handler: Arc<RwLock<Option<EventHandler>>>,
}

impl EventListener {
    pub fn new(connection: Arc<Connection>, factory: MessageFactory, prefetch: Option<u16>) -> Self {
        let options = ListenerOptions {
            exchange_name: connection.config().events_exchange_name.clone(),
            exchange_kind: ExchangeKind::Topic,
            ack_mode: AckMode::Late,
            prefetch,
        };
        Self {
            listener: Listener::new(connection, options),
            factory,
            router: Arc::new(RwLock::new(TopicRouter::new())),
            all_handler: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn init(&self, queue_name: Option<&str>) -> Result<()> {
        let factory = self.factory.clone();
        let router = Arc::clone(&self.router);
        let all_handler = Arc::clone(&self.all_handler);

        let handler = message_handler(move |content, _| {
            let (factory, router, all_handler) = (factory.clone(), Arc::clone(&router), Arc::clone(&all_handler));
            async move {
                let event = factory.decode_event(&content)?;
                dispatch_event(event, &router, &all_handler).await?;
                Ok::<_, BusError>(None)
            }
        });
        self.listener.init(Some(handler), queue_name).await
    }

    /// Route events matching `topic` (default `EVENT.<event_type>`) to `handler`.
    ///
    /// Subscriptions last for the lifetime of the listener.
    pub async fn subscribe(&self, event_type: &str, handler: EventHandler, topic: Option<&str>) -> Result<()> {
        let pattern = topic.map(str::to_string).unwrap_or_else(|| default_topic(event_type));
        self.listener.bind(&pattern).await?;
        self.router.write().await.add(&pattern, handler);
        debug!("Subscribed to {} events on {}", event_type, pattern);
        Ok(())
    }

    /// Receive every event, in addition to pattern handlers
    pub async fn subscribe_all(&self, handler: EventHandler) -> Result<()> {
        self.listener.bind(crate::trie::WILDCARD_MULTI).await?;
        *self.all_handler.write().await = Some(handler);
        Ok(())
    }
}

async fn dispatch_event(
    event: IncomingEvent,
    router: &RwLock<TopicRouter<EventHandler>>,
    all_handler: &RwLock<Option<EventHandler>>,
) -> Result<()> {
    let catch_all = all_handler.read().await.clone();
    if let Some(handler) = catch_all {
        handler.call(event.clone()).await?;
    }

    if event.topic.is_empty() {
        warn!("Dropping {} event without topic", event.event_type);
        return Ok(());
    }

    let handlers = router.read().await.match_topic(&event.topic);
    for handler in handlers {
        handler.call(event.clone()).await?;
    }
    Ok(())
}

impl Deref for EventListener {
    type Target = Listener;

    fn deref(&self) -> &Listener {
        &self.listener
    }
}

impl std::fmt::Debug for EventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListener")
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::testing::{memory_connection, wait_until};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn counting(counter: &Arc<AtomicUsize>) -> EventHandler {
        let counter = Arc::clone(counter);
        EventHandler::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
    }

    async fn setup() -> (EventDispatcher, EventListener, crate::driver::MemoryBroker) {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let factory = MessageFactory::json();
        let dispatcher = EventDispatcher::new(connection.clone(), factory.clone());
        dispatcher.init().await.unwrap();
        let listener = EventListener::new(connection, factory, Some(8));
        listener.init(Some("users.Events")).await.unwrap();
        (dispatcher, listener, broker)
    }

    #[tokio::test]
    async fn test_default_topic_subscription() {
        let (dispatcher, listener, broker) = setup().await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        listener
            .subscribe(
                "user.created",
                EventHandler::new(move |event: IncomingEvent| {
                    sink.lock().unwrap().push((event.topic, event.data));
                    async { Ok(()) }
                }),
                None,
            )
            .await
            .unwrap();
        listener.start().await.unwrap();

        dispatcher.publish("user.created", &json!({"id": 3}), None).await.unwrap();
        dispatcher.publish("user.deleted", &json!({"id": 4}), None).await.unwrap();

        wait_until(|| seen.lock().unwrap().len() == 1).await;
        wait_until(|| broker.unacked_count() == 0).await;
        assert_eq!(
            seen.lock().unwrap()[0],
            ("EVENT.user.created".to_string(), json!({"id": 3}))
        );
        assert_eq!(broker.queue_depth("users.Events"), 0);

        let stats = broker.publish_stats(crate::config::DEFAULT_EVENTS_EXCHANGE);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.transient, 0);
    }

    #[tokio::test]
    async fn test_overlapping_patterns_all_run() {
        let (dispatcher, listener, broker) = setup().await;
        let (users, everything, shared) = (Arc::default(), Arc::default(), Arc::default());
        listener
            .subscribe("user", counting(&users), Some("EVENT.user.*"))
            .await
            .unwrap();
        listener
            .subscribe("any", counting(&everything), Some("EVENT.#"))
            .await
            .unwrap();
        let once = counting(&shared);
        listener.subscribe("a", once.clone(), Some("*.user.created")).await.unwrap();
        listener.subscribe("b", once, Some("EVENT.*.created")).await.unwrap();
        listener.start().await.unwrap();

        dispatcher.publish("user.created", &json!({}), None).await.unwrap();
        dispatcher.publish("order.created", &json!({}), None).await.unwrap();

        wait_until(|| everything.load(Ordering::SeqCst) == 2).await;
        wait_until(|| broker.unacked_count() == 0).await;
        assert_eq!(users.load(Ordering::SeqCst), 1);
        assert_eq!(shared.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_catch_all_and_empty_topic() {
        let (dispatcher, listener, broker) = setup().await;
        let (all, patterned) = (Arc::default(), Arc::default());
        listener.subscribe_all(counting(&all)).await.unwrap();
        listener.subscribe("x", counting(&patterned), Some("#")).await.unwrap();
        listener.start().await.unwrap();

        dispatcher.publish("audit", &json!({}), Some("")).await.unwrap();
        wait_until(|| all.load(Ordering::SeqCst) == 1).await;
        wait_until(|| broker.unacked_count() == 0).await;
        assert_eq!(patterned.load(Ordering::SeqCst), 0);

        dispatcher.publish("audit", &json!({}), Some("AUDIT.login")).await.unwrap();
        wait_until(|| all.load(Ordering::SeqCst) == 2).await;
        wait_until(|| patterned.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_failing_handler_rejects_event() {
        let (dispatcher, listener, broker) = setup().await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        listener
            .subscribe(
                "user.created",
                EventHandler::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(BusError::handler_error("boom")) }
                }),
                None,
            )
            .await
            .unwrap();
        listener.start().await.unwrap();

        dispatcher.publish("user.created", &json!({}), None).await.unwrap();
        wait_until(|| attempts.load(Ordering::SeqCst) == 1).await;
        wait_until(|| broker.unacked_count() == 0).await;
        assert_eq!(broker.queue_depth("users.Events"), 0);
    }

    #[tokio::test]
    async fn test_publish_errors() {
        let (dispatcher, listener, _broker) = setup().await;
        assert!(matches!(
            dispatcher.publish("", &json!({}), None).await,
            Err(BusError::InvalidMessage { .. })
        ));

        listener.connection().disconnect().await.unwrap();
        assert!(matches!(
            dispatcher.publish("user.created", &json!({}), None).await,
            Err(BusError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_requires_init() {
        let (connection, _broker) = memory_connection(BusConfig::default()).await;
        let listener = EventListener::new(connection, MessageFactory::json(), None);
        let counter = Arc::default();
        assert!(matches!(
            listener.subscribe("user.created", counting(&counter), None).await,
            Err(BusError::NotInitialized)
        ));
    }

    #[test]
    fn test_handler_equality_is_identity() {
        let counter = Arc::default();
        let first = counting(&counter);
        let second = counting(&counter);
        assert_eq!(first, first.clone());
        assert_ne!(first, second);
    }
}
