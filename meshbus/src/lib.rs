//! # meshbus - RPC and events over a topic-routed message broker
//!
//! Services expose request/response methods and publish structured events
//! without knowing where their peers run. Requests travel over a topic
//! exchange, replies come back on a direct exchange keyed by a per-process
//! reply queue, and events fan out over a third topic exchange.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshbus::{BusConfig, Context, MessageService, MethodCall, ServiceDefinition, ServiceDescriptor, ServiceOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> meshbus::Result<()> {
//!     meshbus::init_tracing("info,meshbus=debug");
//!
//!     let config = BusConfig::from_env()?;
//!     let context = Arc::new(Context::amqp(config.clone()));
//!     context.init(&config.amqp_url).await?;
//!
//!     let users = ServiceDefinition::new(
//!         ServiceDescriptor::new("shop.users").with_method("get", "shop.GetUser", "shop.User"),
//!     )
//!     .function("get", |call: MethodCall| async move {
//!         Ok(serde_json::json!({ "id": call.request["id"], "name": "Ada" }))
//!     });
//!
//!     let service = MessageService::new(Arc::clone(&context), users, ServiceOptions::default())?;
//!     service.init().await?;
//!
//!     let user = service.proxy()?.invoke("get", serde_json::json!({ "id": 1 }), None).await?;
//!     println!("{}", user);
//!
//!     context.close().await
//! }
//! ```

pub mod cluster;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod event;
pub mod listener;
pub mod logging;
pub mod message;
pub mod proxy;
pub mod schema;
pub mod service;
pub mod trie;

#[cfg(test)]
mod testing;

pub use cluster::ServiceCluster;
pub use codec::{Codec, JsonCodec};
pub use config::BusConfig;
pub use connection::{message_handler, AckMode, Connection, MessageHandler};
pub use context::Context;
pub use dispatcher::MessageDispatcher;
pub use driver::{AmqpConfig, AmqpDriver, BrokerDriver, MemoryBroker, PublishStats};
pub use error::{BusError, Result};
pub use event::{EventDispatcher, EventHandler, EventListener};
pub use listener::{Listener, ListenerOptions, ListenerStatus, MessageListener, ReplyListener};
pub use logging::init_tracing;
pub use message::{IncomingEvent, IncomingRequest, MessageFactory, MethodResponse};
pub use proxy::ServiceProxy;
pub use schema::{MethodDescriptor, SchemaRegistry, ServiceDescriptor};
pub use service::{FunctionMethod, MessageService, MethodCall, ServiceDefinition, ServiceMethod, ServiceOptions};
pub use trie::TopicRouter;
