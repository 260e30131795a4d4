use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::BusConfig;
use crate::driver::{
    AmqpDriver, BrokerDriver, ChannelId, ConsumeOptions, Delivery, ExchangeKind, ExchangeOptions, PublishProperties,
    QueueOptions,
};
use crate::error::{BusError, Result};

/// Async message handler: receives the payload and correlation id, returns an optional reply
pub type MessageHandler =
    Arc<dyn Fn(Vec<u8>, String) -> BoxFuture<'static, Result<Option<Vec<u8>>>> + Send + Sync>;

/// Wrap an async closure into a [`MessageHandler`]
pub fn message_handler<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(Vec<u8>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Vec<u8>>>> + Send + 'static,
{
    Arc::new(move |data, correlation_id| Box::pin(handler(data, correlation_id)))
}

/// When a consumed message is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// On receipt, before the handler runs
    #[default]
    Early,
    /// After the handler settles; failures are rejected
    Late,
}

/// Process-wide broker session.
///
/// Owns the driver and the connected flag. Every channel operation fails with
/// [`BusError::NotConnected`] while disconnected.
pub struct Connection {
    driver: Arc<dyn BrokerDriver>,
    config: BusConfig,
    connected: AtomicBool,
}

impl Connection {
    pub fn new(driver: Arc<dyn BrokerDriver>, config: BusConfig) -> Self {
        Self {
            driver,
            config,
            connected: AtomicBool::new(false),
        }
    }

    /// Session over the lapin driver
    pub fn amqp(config: BusConfig) -> Self {
        Self::new(Arc::new(AmqpDriver::new()), config)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn connect(&self, url: &str) -> Result<()> {
        if self.is_connected() {
            return Err(BusError::AlreadyConnected);
        }
        self.driver.connect(url).await?;
        self.connected.store(true, Ordering::SeqCst);
        info!("Session connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.driver.disconnect().await?;
        info!("Session disconnected");
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }

    pub async fn open_channel(&self) -> Result<ChannelId> {
        self.ensure_connected()?;
        self.driver.open_channel().await
    }

    pub async fn close_channel(&self, channel: ChannelId) -> Result<()> {
        self.ensure_connected()?;
        self.driver.close_channel(channel).await
    }

    pub async fn declare_exchange(&self, channel: ChannelId, name: &str, kind: ExchangeKind) -> Result<()> {
        self.ensure_connected()?;
        self.driver
            .declare_exchange(channel, name, kind, ExchangeOptions::default())
            .await
    }

    pub async fn declare_queue(&self, channel: ChannelId, name: Option<&str>, options: QueueOptions) -> Result<String> {
        self.ensure_connected()?;
        self.driver.declare_queue(channel, name, options).await
    }

    pub async fn bind_queue(&self, channel: ChannelId, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_connected()?;
        self.driver.bind_queue(channel, queue, exchange, routing_key).await
    }

    pub async fn unbind_queue(&self, channel: ChannelId, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_connected()?;
        self.driver.unbind_queue(channel, queue, exchange, routing_key).await
    }

    pub async fn delete_queue(&self, channel: ChannelId, queue: &str) -> Result<()> {
        self.ensure_connected()?;
        self.driver.delete_queue(channel, queue).await
    }

    /// Drop every ready message in `queue`, returning how many were removed
    pub async fn purge_queue(&self, channel: ChannelId, queue: &str) -> Result<u32> {
        self.ensure_connected()?;
        self.driver.purge_queue(channel, queue).await
    }

    pub async fn prefetch(&self, channel: ChannelId, count: u16) -> Result<()> {
        self.ensure_connected()?;
        self.driver.prefetch(channel, count).await
    }

    pub async fn cancel(&self, channel: ChannelId, consumer_tag: &str) -> Result<()> {
        self.ensure_connected()?;
        self.driver.cancel(channel, consumer_tag).await
    }

    pub async fn publish(
        &self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.driver
            .publish(channel, exchange, routing_key, payload, properties)
            .await
    }

    /// Start consuming `queue`, handling every delivery in its own task.
    ///
    /// Each message races the configured processing timeout. A handler that
    /// loses the race keeps running; only its outcome is discarded. Non-empty
    /// results are published to the callbacks exchange under the message's
    /// reply-to key.
    pub async fn consume(
        self: &Arc<Self>,
        channel: ChannelId,
        queue: &str,
        handler: MessageHandler,
        options: ConsumeOptions,
        ack_mode: AckMode,
    ) -> Result<()> {
        self.ensure_connected()?;
        let mut deliveries = self.driver.consume(channel, queue, &options).await?;

        let session = Arc::clone(self);
        let no_ack = options.no_ack;
        let span = info_span!("consumer", queue = %queue, consumer_tag = %options.consumer_tag);

        tokio::spawn(
            async move {
                debug!("Consumer started");
                while let Some(delivery) = deliveries.next().await {
                    match delivery {
                        Ok(delivery) => {
                            let session = Arc::clone(&session);
                            let handler = Arc::clone(&handler);
                            tokio::spawn(
                                async move {
                                    session
                                        .process_delivery(channel, delivery, handler, ack_mode, no_ack)
                                        .await
                                }
                                .in_current_span(),
                            );
                        }
                        Err(e) => {
                            error!("Error receiving message: {}", e);
                        }
                    }
                }
                debug!("Consumer stopped");
            }
            .instrument(span),
        );

        Ok(())
    }

    async fn process_delivery(
        &self,
        channel: ChannelId,
        delivery: Delivery,
        handler: MessageHandler,
        ack_mode: AckMode,
        no_ack: bool,
    ) {
        let Delivery {
            delivery_tag,
            correlation_id,
            reply_to,
            data,
            ..
        } = delivery;
        let correlation_id = correlation_id.unwrap_or_default();
        let must_ack = !no_ack;

        if ack_mode == AckMode::Early && must_ack {
            if let Err(e) = self.driver.ack(channel, delivery_tag).await {
                error!("Failed to acknowledge {}: {}", correlation_id, e);
            }
        }

        match self.run_handler(&handler, data, &correlation_id).await {
            Ok(reply) => {
                if ack_mode == AckMode::Late && must_ack {
                    if let Err(e) = self.driver.ack(channel, delivery_tag).await {
                        error!("Failed to acknowledge {}: {}", correlation_id, e);
                    }
                }

                if let (Some(reply_to), Some(reply)) = (reply_to, reply) {
                    if !reply_to.is_empty() && !reply.is_empty() {
                        self.send_reply(channel, &reply_to, &correlation_id, &reply).await;
                    }
                }
            }
            Err(e) => {
                error!("Failed processing message {}: {}", correlation_id, e);
                if ack_mode == AckMode::Late && must_ack {
                    let requeue = e.is_external();
                    if requeue {
                        warn!("Requeuing message {}", correlation_id);
                    } else {
                        warn!("Rejecting message {}", correlation_id);
                    }
                    if let Err(e) = self.driver.reject(channel, delivery_tag, requeue).await {
                        error!("Failed to reject {}: {}", correlation_id, e);
                    }
                }
            }
        }
    }

    async fn run_handler(
        &self,
        handler: &MessageHandler,
        data: Vec<u8>,
        correlation_id: &str,
    ) -> Result<Option<Vec<u8>>> {
        let timeout = self.config.message_timeout();
        let task = tokio::spawn(handler(data, correlation_id.to_string()));

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(BusError::Join(e)),
            Err(_) => Err(BusError::Timeout {
                correlation_id: correlation_id.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn send_reply(&self, channel: ChannelId, reply_to: &str, correlation_id: &str, reply: &[u8]) {
        let properties = PublishProperties::new(correlation_id).persistent();
        match self
            .publish(channel, &self.config.callbacks_exchange_name, reply_to, reply, &properties)
            .await
        {
            Ok(()) => debug!("Sent reply {} to {}", correlation_id, reply_to),
            Err(e) => error!("Failed to send reply {} to {}: {}", correlation_id, reply_to, e),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_connection, wait_until};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const WORK_QUEUE: &str = "work";

    fn consume_options() -> ConsumeOptions {
        ConsumeOptions {
            consumer_tag: uuid::Uuid::new_v4().to_string(),
            no_ack: false,
            exclusive: false,
        }
    }

    async fn work_channel(connection: &Connection) -> ChannelId {
        let channel = connection.open_channel().await.unwrap();
        connection
            .declare_queue(channel, Some(WORK_QUEUE), QueueOptions::named())
            .await
            .unwrap();
        channel
    }

    async fn send(connection: &Connection, channel: ChannelId, payload: &[u8]) {
        connection
            .publish(
                channel,
                "",
                WORK_QUEUE,
                payload,
                &PublishProperties::new(uuid::Uuid::new_v4().to_string()),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (connection, _broker) = memory_connection(BusConfig::default()).await;
        assert!(matches!(
            connection.connect("memory://again").await,
            Err(BusError::AlreadyConnected)
        ));

        connection.disconnect().await.unwrap();
        assert!(!connection.is_connected());
        assert!(matches!(connection.open_channel().await, Err(BusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_purge_drops_ready_messages() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let channel = work_channel(&connection).await;
        for id in ["1", "2"] {
            connection
                .publish(channel, "", WORK_QUEUE, b"job", &PublishProperties::new(id))
                .await
                .unwrap();
        }

        assert_eq!(connection.purge_queue(channel, WORK_QUEUE).await.unwrap(), 2);
        connection.delete_queue(channel, WORK_QUEUE).await.unwrap();
        assert!(!broker.queue_exists(WORK_QUEUE));
    }

    #[tokio::test]
    async fn test_early_ack_happens_before_handler() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let channel = work_channel(&connection).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let observer = broker.clone();
        let handler = message_handler(move |_, _| {
            let _ = tx.send(observer.unacked_count());
            async { Ok(None) }
        });
        connection
            .consume(channel, WORK_QUEUE, handler, consume_options(), AckMode::Early)
            .await
            .unwrap();

        send(&connection, channel, b"job").await;
        assert_eq!(rx.recv().await, Some(0));
    }

    #[tokio::test]
    async fn test_late_ack_happens_after_handler() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let channel = work_channel(&connection).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let observer = broker.clone();
        let handler = message_handler(move |_, _| {
            let _ = tx.send(observer.unacked_count());
            async { Ok(None) }
        });
        connection
            .consume(channel, WORK_QUEUE, handler, consume_options(), AckMode::Late)
            .await
            .unwrap();

        send(&connection, channel, b"job").await;
        assert_eq!(rx.recv().await, Some(1));
        wait_until(|| broker.unacked_count() == 0).await;
    }

    #[tokio::test]
    async fn test_late_ack_prefetch_bounds_in_flight_messages() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let channel = work_channel(&connection).await;
        connection.prefetch(channel, 2).await.unwrap();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let (active, peak, done) = (in_flight.clone(), max_in_flight.clone(), completed.clone());
        let handler = message_handler(move |_, _| {
            let (active, peak, done) = (active.clone(), peak.clone(), done.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        });
        connection
            .consume(channel, WORK_QUEUE, handler, consume_options(), AckMode::Late)
            .await
            .unwrap();

        for i in 0..6u8 {
            send(&connection, channel, &[i]).await;
            assert!(broker.unacked_count() <= 2);
        }

        wait_until(|| completed.load(Ordering::SeqCst) == 6).await;
        assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
        wait_until(|| broker.unacked_count() == 0).await;
        assert_eq!(broker.queue_depth(WORK_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_external_failure_is_requeued() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let channel = work_channel(&connection).await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let handler = message_handler(move |_, _| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(BusError::external("database unavailable"))
                } else {
                    Ok(None)
                }
            }
        });
        connection
            .consume(channel, WORK_QUEUE, handler, consume_options(), AckMode::Late)
            .await
            .unwrap();

        send(&connection, channel, b"job").await;
        wait_until(|| attempts.load(Ordering::SeqCst) == 2).await;
        wait_until(|| broker.unacked_count() == 0).await;
        assert_eq!(broker.queue_depth(WORK_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_handler_failure_is_dropped() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let channel = work_channel(&connection).await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let handler = message_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(BusError::handler_error("bad input")) }
        });
        connection
            .consume(channel, WORK_QUEUE, handler, consume_options(), AckMode::Late)
            .await
            .unwrap();

        send(&connection, channel, b"job").await;
        wait_until(|| attempts.load(Ordering::SeqCst) == 1).await;
        wait_until(|| broker.unacked_count() == 0).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(broker.queue_depth(WORK_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_early_ack_never_rejects() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let channel = work_channel(&connection).await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let handler = message_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            // would be requeued under late-ack
            async { Err(BusError::external("database unavailable")) }
        });
        connection
            .consume(channel, WORK_QUEUE, handler, consume_options(), AckMode::Early)
            .await
            .unwrap();

        send(&connection, channel, b"job").await;
        wait_until(|| attempts.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.queue_depth(WORK_QUEUE), 0);
    }

    #[tokio::test]
    async fn test_timeout_rejects_while_handler_keeps_running() {
        let config = BusConfig::default().with_message_timeout(Duration::from_millis(30));
        let (connection, broker) = memory_connection(config).await;
        let channel = work_channel(&connection).await;

        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let handler = message_handler(move |_, _| {
            let flag = flag.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(None)
            }
        });
        connection
            .consume(channel, WORK_QUEUE, handler, consume_options(), AckMode::Late)
            .await
            .unwrap();

        send(&connection, channel, b"slow").await;
        wait_until(|| broker.unacked_count() == 0).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(broker.queue_depth(WORK_QUEUE), 0);

        wait_until(|| finished.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn test_reply_is_published_to_reply_to_key() {
        let (connection, broker) = memory_connection(BusConfig::default()).await;
        let channel = work_channel(&connection).await;
        let callbacks = connection.config().callbacks_exchange_name.clone();
        connection
            .declare_exchange(channel, &callbacks, ExchangeKind::Direct)
            .await
            .unwrap();
        let reply_queue = connection
            .declare_queue(channel, None, QueueOptions::anonymous())
            .await
            .unwrap();
        connection
            .bind_queue(channel, &reply_queue, &callbacks, &reply_queue)
            .await
            .unwrap();

        let handler = message_handler(|data, _| async move {
            assert_eq!(data, b"ping");
            Ok(Some(b"pong".to_vec()))
        });
        connection
            .consume(channel, WORK_QUEUE, handler, consume_options(), AckMode::Early)
            .await
            .unwrap();

        let properties = PublishProperties::new("abc").with_reply_to(reply_queue.clone());
        connection
            .publish(channel, "", WORK_QUEUE, b"ping", &properties)
            .await
            .unwrap();

        wait_until(|| broker.queue_depth(&reply_queue) == 1).await;
        let mut replies = broker.consume(channel, &reply_queue, &consume_options()).await.unwrap();
        let reply = replies.next().await.unwrap().unwrap();
        assert_eq!(reply.data, b"pong");
        assert_eq!(reply.correlation_id.as_deref(), Some("abc"));
        assert!(reply.persistent);
        assert_eq!(broker.publish_stats(&callbacks).transient, 0);
    }
}
