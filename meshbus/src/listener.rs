//! Channel and queue lifecycle for a single consumer.
//!
//! A [`Listener`] goes `Idle -> Initialized -> Started -> Closed` and may be
//! initialized again after closing. It owns exactly one channel.

use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{message_handler, AckMode, Connection, MessageHandler};
use crate::driver::{ChannelId, ConsumeOptions, ExchangeKind, QueueOptions};
use crate::error::{BusError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerStatus {
    #[default]
    Idle,
    Initialized,
    Started,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub exchange_name: String,
    pub exchange_kind: ExchangeKind,
    pub ack_mode: AckMode,
    /// Applied before consuming, late-ack only
    pub prefetch: Option<u16>,
}

#[derive(Default)]
struct ListenerState {
    channel: Option<ChannelId>,
    queue_name: Option<String>,
    consumer_tag: Option<String>,
    handler: Option<MessageHandler>,
    anonymous: bool,
    status: ListenerStatus,
}

pub struct Listener {
    connection: Arc<Connection>,
    options: ListenerOptions,
    state: Mutex<ListenerState>,
}

fn unhandled(queue: String) -> MessageHandler {
    message_handler(move |_, correlation_id| {
        warn!("No handler on queue {}, dropping message {}", queue, correlation_id);
        async { Ok(None) }
    })
}

impl Listener {
    pub fn new(connection: Arc<Connection>, options: ListenerOptions) -> Self {
        Self {
            connection,
            options,
            state: Mutex::new(ListenerState::default()),
        }
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub async fn status(&self) -> ListenerStatus {
        self.state.lock().await.status
    }

    pub async fn queue_name(&self) -> Option<String> {
        self.state.lock().await.queue_name.clone()
    }

    /// Open the channel and declare the exchange and queue.
    ///
    /// Without `queue_name`, or with an empty one, the queue is anonymous.
    /// Queues on a direct exchange are bound under their own name. A second
    /// call is a no-op.
    pub async fn init(&self, handler: Option<MessageHandler>, queue_name: Option<&str>) -> Result<()> {
        let queue_name = queue_name.filter(|name| !name.is_empty());
        let mut state = self.state.lock().await;
        if state.channel.is_some() {
            debug!("Listener on {} already initialized", self.options.exchange_name);
            return Ok(());
        }
        if self.options.exchange_name.is_empty() {
            return Err(BusError::MissingExchange);
        }
        if !self.connection.is_connected() {
            return Err(BusError::Connection);
        }

        let channel = self.connection.open_channel().await?;
        let queue = match self.declare(channel, queue_name).await {
            Ok(queue) => queue,
            Err(e) => {
                if let Err(close_error) = self.connection.close_channel(channel).await {
                    warn!("Failed to close {} after declare error: {}", channel, close_error);
                }
                return Err(e);
            }
        };

        info!("Listener initialized on queue {} ({})", queue, self.options.exchange_name);
        *state = ListenerState {
            channel: Some(channel),
            queue_name: Some(queue),
            consumer_tag: None,
            handler,
            anonymous: queue_name.is_none(),
            status: ListenerStatus::Initialized,
        };
        Ok(())
    }

    async fn declare(&self, channel: ChannelId, queue_name: Option<&str>) -> Result<String> {
        let exchange = &self.options.exchange_name;
        self.connection
            .declare_exchange(channel, exchange, self.options.exchange_kind)
            .await?;

        let options = match queue_name {
            Some(_) => QueueOptions::named(),
            None => QueueOptions::anonymous(),
        };
        let queue = self.connection.declare_queue(channel, queue_name, options).await?;

        if self.options.exchange_kind == ExchangeKind::Direct {
            self.connection.bind_queue(channel, &queue, exchange, &queue).await?;
        }
        Ok(queue)
    }

    /// Bind the queue to the listener's exchange under `routing_key`
    pub async fn bind(&self, routing_key: &str) -> Result<()> {
        let state = self.state.lock().await;
        let (Some(channel), Some(queue)) = (state.channel, state.queue_name.as_deref()) else {
            return Err(BusError::NotInitialized);
        };
        self.connection
            .bind_queue(channel, queue, &self.options.exchange_name, routing_key)
            .await?;
        debug!("Bound {} to {} with {}", queue, self.options.exchange_name, routing_key);
        Ok(())
    }

    pub async fn unbind(&self, routing_key: &str) -> Result<()> {
        let state = self.state.lock().await;
        let (Some(channel), Some(queue)) = (state.channel, state.queue_name.as_deref()) else {
            return Err(BusError::NotInitialized);
        };
        self.connection
            .unbind_queue(channel, queue, &self.options.exchange_name, routing_key)
            .await?;
        debug!("Unbound {} from {} with {}", queue, self.options.exchange_name, routing_key);
        Ok(())
    }

    /// Begin consuming. Starting an already started listener only logs a warning.
    pub async fn start(&self) -> Result<()> {
        match self.try_start().await {
            Err(BusError::AlreadyStarted) => {
                warn!("Listener on {} already started", self.options.exchange_name);
                Ok(())
            }
            outcome => outcome,
        }
    }

    async fn try_start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let (Some(channel), Some(queue)) = (state.channel, state.queue_name.clone()) else {
            return Err(BusError::NotInitialized);
        };
        if !self.connection.is_connected() {
            return Err(BusError::NotConnected);
        }
        if state.consumer_tag.is_some() {
            return Err(BusError::AlreadyStarted);
        }

        if self.options.ack_mode == AckMode::Late {
            if let Some(prefetch) = self.options.prefetch.filter(|count| *count > 0) {
                self.connection.prefetch(channel, prefetch).await?;
            }
        }

        let consumer_tag = uuid::Uuid::new_v4().to_string();
        let handler = state
            .handler
            .clone()
            .unwrap_or_else(|| unhandled(queue.clone()));
        let options = ConsumeOptions {
            consumer_tag: consumer_tag.clone(),
            no_ack: false,
            exclusive: state.anonymous,
        };
        self.connection
            .consume(channel, &queue, handler, options, self.options.ack_mode)
            .await?;

        info!("Listener started on queue {}", queue);
        state.consumer_tag = Some(consumer_tag);
        state.status = ListenerStatus::Started;
        Ok(())
    }

    /// Cancel the consumer, close the channel and forget the queue
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let (Some(channel), Some(queue)) = (state.channel, state.queue_name.clone()) else {
            return Err(BusError::NotInitialized);
        };
        if !self.connection.is_connected() {
            return Err(BusError::NotConnected);
        }

        if let Some(consumer_tag) = state.consumer_tag.take() {
            self.connection.cancel(channel, &consumer_tag).await?;
        }
        self.connection.close_channel(channel).await?;

        info!("Listener on queue {} closed", queue);
        *state = ListenerState {
            status: ListenerStatus::Closed,
            ..Default::default()
        };
        Ok(())
    }

    /// Forget the channel, queue and consumer without talking to the broker.
    ///
    /// Used after the session went away underneath the listener.
    pub(crate) async fn discard(&self) {
        let mut state = self.state.lock().await;
        if state.channel.is_some() {
            debug!("Discarding listener on {}", self.options.exchange_name);
        }
        *state = ListenerState {
            status: ListenerStatus::Closed,
            ..Default::default()
        };
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("options", &self.options).finish()
    }
}

/// Early-ack listener on an anonymous queue of the callbacks exchange
#[derive(Debug)]
pub struct ReplyListener {
    listener: Listener,
}

impl ReplyListener {
    pub fn new(connection: Arc<Connection>) -> Self {
        let options = ListenerOptions {
            exchange_name: connection.config().callbacks_exchange_name.clone(),
            exchange_kind: ExchangeKind::Direct,
            ack_mode: AckMode::Early,
            prefetch: None,
        };
        Self {
            listener: Listener::new(connection, options),
        }
    }

    /// Routing key replies must be published under
    pub async fn reply_queue(&self) -> Option<String> {
        self.listener.queue_name().await
    }
}

impl Deref for ReplyListener {
    type Target = Listener;

    fn deref(&self) -> &Listener {
        &self.listener
    }
}

/// Listener on the bus exchange.
///
/// With a concurrency bound the listener switches to late-ack and uses the
/// bound as prefetch.
#[derive(Debug)]
pub struct MessageListener {
    listener: Listener,
}

impl MessageListener {
    pub fn new(connection: Arc<Connection>, max_concurrent: Option<u16>) -> Self {
        let ack_mode = match max_concurrent {
            Some(_) => AckMode::Late,
            None => AckMode::Early,
        };
        let options = ListenerOptions {
            exchange_name: connection.config().bus_exchange_name.clone(),
            exchange_kind: ExchangeKind::Topic,
            ack_mode,
            prefetch: max_concurrent,
        };
        Self {
            listener: Listener::new(connection, options),
        }
    }

    /// Bind every routing pattern in `topics`
    pub async fn subscribe<I, S>(&self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for topic in topics {
            self.listener.bind(topic.as_ref()).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe<I, S>(&self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for topic in topics {
            self.listener.unbind(topic.as_ref()).await?;
        }
        Ok(())
    }
}

impl Deref for MessageListener {
    type Target = Listener;

    fn deref(&self) -> &Listener {
        &self.listener
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::driver::{BrokerDriver, MemoryBroker, PublishProperties};
    use crate::testing::{memory_connection, wait_until, MEMORY_URL};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn topic_listener(connection: Arc<Connection>, exchange: &str) -> Listener {
        Listener::new(
            connection,
            ListenerOptions {
                exchange_name: exchange.to_string(),
                exchange_kind: ExchangeKind::Topic,
                ack_mode: AckMode::Early,
                prefetch: None,
            },
        )
    }

    #[tokio::test]
    async fn test_init_requires_exchange_and_connection() {
        let (connection, _broker) = memory_connection(BusConfig::default()).await;
        let listener = topic_listener(connection, "");
        assert!(matches!(listener.init(None, None).await, Err(BusError::MissingExchange)));

        let disconnected = Arc::new(Connection::new(Arc::new(MemoryBroker::new()), BusConfig::default()));
        let listener = topic_listener(disconnected, "proto.bus");
        assert!(matches!(listener.init(None, None).await, Err(BusError::Connection)));
        assert_eq!(listener.status().await, ListenerStatus::Idle);
    }

    #[tokio::test]
    async fn test_start_and_close_require_init() {
        let (connection, _broker) = memory_connection(BusConfig::default()).await;
        let listener = topic_listener(connection.clone(), "proto.bus");
        assert!(matches!(listener.start().await, Err(BusError::NotInitialized)));
        assert!(matches!(listener.close().await, Err(BusError::NotInitialized)));

        listener.init(None, Some("orders")).await.unwrap();
        connection.disconnect().await.unwrap();
        assert!(matches!(listener.start().await, Err(BusError::NotConnected)));
        assert!(matches!(listener.close().await, Err(BusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_init_twice_is_idempotent() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let listener = topic_listener(connection, "proto.bus");

        listener.init(None, Some("orders")).await.unwrap();
        listener.init(None, Some("other")).await.unwrap();

        assert_eq!(listener.queue_name().await.as_deref(), Some("orders"));
        assert_eq!(broker.open_channels(), 1);
        assert!(!broker.queue_exists("other"));
        assert_eq!(broker.queue_options("orders"), Some(QueueOptions::named()));
        assert_eq!(broker.exchange_kind("proto.bus"), Some(ExchangeKind::Topic));
    }

    #[tokio::test]
    async fn test_empty_queue_name_declares_anonymous_queue() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let listener = topic_listener(connection, "proto.bus");
        listener.init(None, Some("")).await.unwrap();

        let queue = listener.queue_name().await.unwrap();
        assert!(queue.starts_with("amq.gen-"));
        assert_eq!(broker.queue_options(&queue), Some(QueueOptions::anonymous()));

        listener.start().await.unwrap();
        assert_eq!(broker.consumer_count(&queue), 1);
    }

    #[tokio::test]
    async fn test_second_start_is_a_no_op() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let listener = topic_listener(connection, "proto.bus");
        listener.init(None, Some("orders")).await.unwrap();

        listener.start().await.unwrap();
        listener.start().await.unwrap();

        assert_eq!(listener.status().await, ListenerStatus::Started);
        assert_eq!(broker.consumer_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_close_then_reinitialize() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let listener = topic_listener(connection, "proto.bus");
        listener.init(None, Some("orders")).await.unwrap();
        listener.start().await.unwrap();

        listener.close().await.unwrap();
        assert_eq!(listener.status().await, ListenerStatus::Closed);
        assert_eq!(listener.queue_name().await, None);
        assert_eq!(broker.consumer_count("orders"), 0);
        assert_eq!(broker.open_channels(), 0);

        listener.init(None, Some("orders")).await.unwrap();
        listener.start().await.unwrap();
        assert_eq!(broker.consumer_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_reply_listener_binds_its_own_queue() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let listener = ReplyListener::new(connection.clone());
        listener.init(None, None).await.unwrap();

        let queue = listener.reply_queue().await.unwrap();
        let exchange = &connection.config().callbacks_exchange_name;
        assert!(queue.starts_with("amq.gen-"));
        assert_eq!(broker.bindings(exchange, &queue), vec![queue.clone()]);
        assert_eq!(broker.exchange_kind(exchange), Some(ExchangeKind::Direct));
        assert_eq!(broker.queue_options(&queue), Some(QueueOptions::anonymous()));
    }

    #[tokio::test]
    async fn test_message_listener_subscribes_and_consumes() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let listener = MessageListener::new(connection.clone(), Some(4));
        assert_eq!(listener.options().ack_mode, AckMode::Late);

        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let handler = message_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        });
        listener.init(Some(handler), Some("orders")).await.unwrap();
        listener.subscribe(["REQUEST.shop.orders.*", "AUDIT.#"]).await.unwrap();
        listener.start().await.unwrap();

        let bus = &connection.config().bus_exchange_name;
        assert_eq!(broker.bindings(bus, "orders"), vec!["AUDIT.#", "REQUEST.shop.orders.*"]);

        let publisher = broker.clone();
        let channel = publisher.open_channel().await.unwrap();
        for key in ["REQUEST.shop.orders.create", "AUDIT.login.ok", "REQUEST.shop.users.get"] {
            publisher
                .publish(channel, bus, key, b"{}", &PublishProperties::new(key))
                .await
                .unwrap();
        }

        wait_until(|| received.load(Ordering::SeqCst) == 2).await;
        wait_until(|| broker.unacked_count() == 0).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_binding() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let listener = MessageListener::new(connection.clone(), None);
        assert!(matches!(listener.unsubscribe(["AUDIT.#"]).await, Err(BusError::NotInitialized)));

        listener.init(None, Some("orders")).await.unwrap();
        listener.subscribe(["REQUEST.shop.orders.*", "AUDIT.#"]).await.unwrap();
        listener.unsubscribe(["AUDIT.#"]).await.unwrap();

        let bus = &connection.config().bus_exchange_name;
        assert_eq!(broker.bindings(bus, "orders"), vec!["REQUEST.shop.orders.*"]);
    }

    #[tokio::test]
    async fn test_listener_without_handler_drops_messages() {
        let broker = MemoryBroker::new();
        let connection = Arc::new(Connection::new(Arc::new(broker.clone()), BusConfig::default()));
        connection.connect(MEMORY_URL).await.unwrap();

        let listener = MessageListener::new(connection.clone(), None);
        listener.init(None, Some("orders")).await.unwrap();
        listener.subscribe(["#"]).await.unwrap();
        listener.start().await.unwrap();

        let channel = broker.open_channel().await.unwrap();
        broker
            .publish(channel, "proto.bus", "anything", b"{}", &PublishProperties::new("1"))
            .await
            .unwrap();
        wait_until(|| broker.unacked_count() == 0 && broker.queue_depth("orders") == 0).await;
    }
}
