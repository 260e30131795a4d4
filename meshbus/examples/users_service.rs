//! Users service running against RabbitMQ.
//!
//! Hosts two instances of `shop.users`, calls them through a proxy and
//! listens to the events they publish. Configure with `AMQP_URL` and the
//! other `BusConfig` variables.

use anyhow::Result;
use meshbus::{
    BusConfig, BusError, Context, EventHandler, IncomingEvent, MessageService, MethodCall, ServiceCluster,
    ServiceDefinition, ServiceDescriptor, ServiceOptions, ServiceProxy,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
struct RenameUser {
    id: u64,
    name: String,
}

#[derive(Debug, Serialize)]
struct User {
    id: u64,
    name: String,
}

fn users(context: Arc<Context>) -> meshbus::Result<MessageService> {
    let descriptor = ServiceDescriptor::new("shop.users").with_method("rename", "shop.RenameUser", "shop.User");

    let events = Arc::clone(&context);
    let definition = ServiceDefinition::new(descriptor).function("rename", move |call: MethodCall| {
        let events = Arc::clone(&events);
        async move {
            let request: RenameUser = serde_json::from_value(call.request)?;
            if request.name.is_empty() {
                return Err(BusError::handler_error("name must not be empty"));
            }

            let user = User {
                id: request.id,
                name: request.name,
            };
            let user = serde_json::to_value(user)?;
            events.publish_event("user.renamed", &user, None).await?;
            Ok::<_, BusError>(user)
        }
    });

    MessageService::new(
        context,
        definition,
        ServiceOptions {
            max_concurrent: Some(16),
            event_prefetch: Some(16),
        },
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    meshbus::init_tracing("info,meshbus=debug");

    let config = BusConfig::from_env()?;
    info!("🐰 Connecting to {}", config.amqp_url);

    let context = Arc::new(Context::amqp(config.clone()));
    let mut cluster = ServiceCluster::new(Arc::clone(&context));
    cluster.use_service(users, 2)?;
    cluster.init(&config.amqp_url).await?;

    cluster.services()[0]
        .subscribe_event(
            "user.renamed",
            EventHandler::new(|event: IncomingEvent| async move {
                info!("📣 {} on {}: {}", event.event_type, event.topic, event.data);
                Ok(())
            }),
            None,
        )
        .await?;

    let proxy = ServiceProxy::new(Arc::clone(&context), "shop.users")?;
    let user = proxy
        .invoke("rename", serde_json::json!({ "id": 7, "name": "Grace" }), Some("example"))
        .await?;
    info!("✅ Renamed: {}", user);

    match proxy.invoke("rename", serde_json::json!({ "id": 7, "name": "" }), None).await {
        Err(e) => info!("Rejected as expected: {}", e),
        Ok(user) => info!("Unexpected success: {}", user),
    }

    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    cluster.close().await?;
    Ok(())
}
