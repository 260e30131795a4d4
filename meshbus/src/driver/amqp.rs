use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::*,
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{
    BrokerDriver, ChannelId, ConsumeOptions, Delivery, DeliveryStream, ExchangeKind, ExchangeOptions,
    PublishProperties, QueueOptions,
};
use crate::error::{BusError, Result};

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Connection settings for the lapin driver
#[derive(Debug, Clone)]
pub struct AmqpConfig {
    /// Timeout for a single connection attempt in milliseconds
    pub connection_timeout_ms: u64,
    /// Number of connection attempts before giving up
    pub max_retries: u32,
    /// Delay between attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Prefix of the connection name shown in the broker management UI
    pub connection_name: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 10_000,
            max_retries: 5,
            retry_delay_ms: 1_000,
            connection_name: "meshbus".to_string(),
        }
    }
}

/// Broker driver backed by a lapin AMQP 0-9-1 connection
pub struct AmqpDriver {
    config: AmqpConfig,
    connection: RwLock<Option<Connection>>,
    channels: Mutex<HashMap<ChannelId, Channel>>,
    next_channel: AtomicU64,
}

impl AmqpDriver {
    pub fn new() -> Self {
        Self::with_config(AmqpConfig::default())
    }

    pub fn with_config(config: AmqpConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
            channels: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(1),
        }
    }

    async fn try_connect(&self, url: &str) -> Result<Connection> {
        debug!("Attempting to connect to {}", url);

        let properties = ConnectionProperties::default().with_connection_name(
            format!("{}-{}", self.config.connection_name, uuid::Uuid::new_v4()).into(),
        );
        let attempt = Connection::connect(url, properties);

        match tokio::time::timeout(Duration::from_millis(self.config.connection_timeout_ms), attempt).await {
            Ok(connection) => Ok(connection?),
            Err(_) => Err(BusError::Timeout {
                correlation_id: "connect".to_string(),
                timeout_ms: self.config.connection_timeout_ms,
            }),
        }
    }

    async fn channel(&self, channel: ChannelId) -> Result<Channel> {
        self.channels
            .lock()
            .await
            .get(&channel)
            .cloned()
            .ok_or_else(|| BusError::broker_error(format!("unknown {}", channel)))
    }
}

impl Default for AmqpDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AmqpDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpDriver").field("config", &self.config).finish()
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        let correlation_id = delivery.properties.correlation_id().as_ref().map(|id| id.as_str().to_string());
        let reply_to = delivery.properties.reply_to().as_ref().map(|key| key.as_str().to_string());

        let persistent = *delivery.properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE);

        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            correlation_id,
            reply_to,
            persistent,
            redelivered: delivery.redelivered,
            data: delivery.data,
        }
    }
}

fn basic_properties(properties: &PublishProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_content_type(ShortString::from(properties.content_type.clone()));
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    basic
}

#[async_trait]
impl BrokerDriver for AmqpDriver {
    /// Establish connection to the broker with retry logic
    async fn connect(&self, url: &str) -> Result<()> {
        let mut attempts = 0;

        loop {
            match self.try_connect(url).await {
                Ok(connection) => {
                    info!("Connected to message bus at {}", url);
                    *self.connection.write().await = Some(connection);
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.max_retries {
                        error!("Failed to connect to broker after {} attempts: {}", attempts, e);
                        return Err(e);
                    }

                    warn!(
                        "Connection attempt {} failed, retrying in {}ms: {}",
                        attempts, self.config.retry_delay_ms, e
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.channels.lock().await.clear();
        if let Some(connection) = self.connection.write().await.take() {
            connection.close(200, "OK").await?;
            info!("Disconnected from message bus");
        }
        Ok(())
    }

    async fn open_channel(&self) -> Result<ChannelId> {
        let channel = {
            let connection = self.connection.read().await;
            let connection = connection.as_ref().ok_or(BusError::NotConnected)?;
            connection.create_channel().await?
        };
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        let id = ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed));
        self.channels.lock().await.insert(id, channel);
        debug!("Opened {}", id);
        Ok(id)
    }

    async fn close_channel(&self, channel: ChannelId) -> Result<()> {
        let removed = self.channels.lock().await.remove(&channel);
        if let Some(removed) = removed {
            if removed.status().connected() {
                removed.close(200, "OK").await?;
            }
            debug!("Closed {}", channel);
        }
        Ok(())
    }

    async fn declare_exchange(
        &self,
        channel: ChannelId,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        self.channel(channel)
            .await?
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!("Declared exchange: {}", name);
        Ok(())
    }

    async fn declare_queue(&self, channel: ChannelId, name: Option<&str>, options: QueueOptions) -> Result<String> {
        let queue = self
            .channel(channel)
            .await?
            .queue_declare(
                name.unwrap_or(""),
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!("Declared queue: {}", queue.name().as_str());
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, channel: ChannelId, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel(channel)
            .await?
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await?;
        debug!("Bound queue {} to {} with key {}", queue, exchange, routing_key);
        Ok(())
    }

    async fn unbind_queue(&self, channel: ChannelId, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel(channel)
            .await?
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, channel: ChannelId, queue: &str) -> Result<()> {
        self.channel(channel)
            .await?
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn purge_queue(&self, channel: ChannelId, queue: &str) -> Result<u32> {
        Ok(self
            .channel(channel)
            .await?
            .queue_purge(queue, QueuePurgeOptions::default())
            .await?)
    }

    async fn prefetch(&self, channel: ChannelId, count: u16) -> Result<()> {
        self.channel(channel)
            .await?
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, channel: ChannelId, queue: &str, options: &ConsumeOptions) -> Result<DeliveryStream> {
        let consumer = self
            .channel(channel)
            .await?
            .basic_consume(
                queue,
                &options.consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!("Created consumer {} for queue: {}", options.consumer_tag, queue);
        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(BusError::from))
            .boxed())
    }

    async fn cancel(&self, channel: ChannelId, consumer_tag: &str) -> Result<()> {
        self.channel(channel)
            .await?
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()> {
        self.channel(channel)
            .await?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                basic_properties(properties),
            )
            .await?
            .await?;

        debug!("Published message to {} with key {}", exchange, routing_key);
        Ok(())
    }

    async fn ack(&self, channel: ChannelId, delivery_tag: u64) -> Result<()> {
        self.channel(channel)
            .await?
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&self, channel: ChannelId, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel(channel)
            .await?
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }
}
