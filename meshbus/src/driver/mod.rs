//! Broker driver abstraction.
//!
//! A driver exposes the raw AMQP-style operations the bus needs, addressed
//! through opaque [`ChannelId`] handles. Ack timing, timeouts and replies are
//! layered on top by [`crate::connection::Connection`].

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::Result;

pub use amqp::{AmqpConfig, AmqpDriver};
pub use memory::{MemoryBroker, PublishStats};

pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Opaque handle to a channel opened on a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Exact routing-key match
    Direct,
    /// Wildcard pattern match
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            internal: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Broker-named, private to one consumer, removed with it
    pub fn anonymous() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// Durable queue shared by every instance of a service
    pub fn named() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub consumer_tag: String,
    pub no_ack: bool,
    pub exclusive: bool,
}

/// Properties attached to a published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
}

impl PublishProperties {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            content_type: CONTENT_TYPE_OCTET_STREAM.to_string(),
            correlation_id: Some(correlation_id.into()),
            reply_to: None,
            persistent: false,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
    pub redelivered: bool,
    pub data: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Raw broker operations
#[async_trait]
pub trait BrokerDriver: Send + Sync {
    async fn connect(&self, url: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn open_channel(&self) -> Result<ChannelId>;

    async fn close_channel(&self, channel: ChannelId) -> Result<()>;

    /// Idempotent for identical declarations
    async fn declare_exchange(
        &self,
        channel: ChannelId,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<()>;

    /// Declare a queue; `None` asks the broker to generate a name. Returns the resolved name.
    async fn declare_queue(&self, channel: ChannelId, name: Option<&str>, options: QueueOptions) -> Result<String>;

    async fn bind_queue(&self, channel: ChannelId, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn unbind_queue(&self, channel: ChannelId, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn delete_queue(&self, channel: ChannelId, queue: &str) -> Result<()>;

    /// Drop every ready message in the queue, returning how many were removed
    async fn purge_queue(&self, channel: ChannelId, queue: &str) -> Result<u32>;

    /// Bound the unacknowledged deliveries outstanding on the channel (0 = unbounded)
    async fn prefetch(&self, channel: ChannelId, count: u16) -> Result<()>;

    async fn consume(&self, channel: ChannelId, queue: &str, options: &ConsumeOptions) -> Result<DeliveryStream>;

    async fn cancel(&self, channel: ChannelId, consumer_tag: &str) -> Result<()>;

    async fn publish(
        &self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()>;

    async fn ack(&self, channel: ChannelId, delivery_tag: u64) -> Result<()>;

    async fn reject(&self, channel: ChannelId, delivery_tag: u64, requeue: bool) -> Result<()>;
}
