use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::codec::{Codec, JsonCodec};
use crate::config::BusConfig;
use crate::connection::Connection;
use crate::dispatcher::MessageDispatcher;
use crate::driver::{AmqpDriver, BrokerDriver};
use crate::error::Result;
use crate::event::EventDispatcher;
use crate::message::MessageFactory;
use crate::schema::SchemaRegistry;

/// Per-process bus handle: one session, one message dispatcher, one event dispatcher
pub struct Context {
    connection: Arc<Connection>,
    factory: MessageFactory,
    dispatcher: MessageDispatcher,
    events: EventDispatcher,
}

impl Context {
    pub fn new(driver: Arc<dyn BrokerDriver>, config: BusConfig, codec: Arc<dyn Codec>) -> Self {
        let connection = Arc::new(Connection::new(driver, config));
        let factory = MessageFactory::new(codec, Arc::new(SchemaRegistry::new()));
        Self::with_factory(connection, factory)
    }

    pub fn with_factory(connection: Arc<Connection>, factory: MessageFactory) -> Self {
        Self {
            dispatcher: MessageDispatcher::new(Arc::clone(&connection)),
            events: EventDispatcher::new(Arc::clone(&connection), factory.clone()),
            connection,
            factory,
        }
    }

    /// Context over RabbitMQ with JSON payloads
    pub fn amqp(config: BusConfig) -> Self {
        Self::new(Arc::new(AmqpDriver::new()), config, Arc::new(JsonCodec::new()))
    }

    /// Connect to `url` unless already connected, then ready both dispatchers
    pub async fn init(&self, url: &str) -> Result<()> {
        if !self.connection.is_connected() {
            self.connection.connect(url).await?;
        }
        self.dispatcher.init().await?;
        self.events.init().await?;
        info!("Bus context initialized");
        Ok(())
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn config(&self) -> &BusConfig {
        self.connection.config()
    }

    pub fn factory(&self) -> &MessageFactory {
        &self.factory
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        self.factory.schema()
    }

    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.dispatcher
    }

    /// See [`MessageDispatcher::publish`]
    pub async fn publish_message(&self, content: &[u8], routing_key: &str, rpc: bool) -> Result<Option<Vec<u8>>> {
        self.dispatcher.publish(content, routing_key, rpc).await
    }

    /// See [`EventDispatcher::publish`]
    pub async fn publish_event(&self, event_type: &str, content: &Value, topic: Option<&str>) -> Result<()> {
        self.events.publish(event_type, content, topic).await
    }

    pub async fn close(&self) -> Result<()> {
        if self.connection.is_connected() {
            self.dispatcher.close().await?;
            self.events.close().await?;
        }
        self.connection.disconnect().await?;
        info!("Bus context closed");
        Ok(())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("connection", &self.connection)
            .field("factory", &self.factory)
            .finish()
    }
}
