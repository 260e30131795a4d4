//! Client stub for a remote service, built from its descriptor.

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::context::Context;
use crate::error::{BusError, Result};
use crate::schema::ServiceDescriptor;
use crate::service::request_topic;

type RemoteCall = Arc<dyn Fn(Value, Option<String>, bool) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Invokes the methods of one remote service over the bus.
///
/// Every declared method gets a pre-built call closure at construction.
#[derive(Clone)]
pub struct ServiceProxy {
    service: Arc<ServiceDescriptor>,
    calls: HashMap<String, RemoteCall>,
}

impl ServiceProxy {
    pub fn new(context: Arc<Context>, service_name: &str) -> Result<Self> {
        let service = context
            .schema()
            .service(service_name)
            .ok_or_else(|| BusError::InvalidServiceName(service_name.to_string()))?;

        let calls = service
            .methods
            .iter()
            .map(|method| {
                let full_name = service.full_method_name(&method.name);
                let context = Arc::clone(&context);
                let call: RemoteCall = Arc::new(move |request, actor, rpc| {
                    let (context, full_name) = (Arc::clone(&context), full_name.clone());
                    Box::pin(async move { remote_call(&context, &full_name, request, actor, rpc).await })
                });
                (method.name.clone(), call)
            })
            .collect();

        Ok(Self { service, calls })
    }

    pub fn service_name(&self) -> &str {
        &self.service.name
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.service
    }

    /// Call `method` and wait for its result
    pub async fn invoke(&self, method: &str, request: Value, actor: Option<&str>) -> Result<Value> {
        self.invoke_with(method, request, actor, true).await
    }

    /// Call `method`; without `rpc` the call is fire-and-forget and yields `{}`
    pub async fn invoke_with(&self, method: &str, request: Value, actor: Option<&str>, rpc: bool) -> Result<Value> {
        let call = self.calls.get(method).ok_or_else(|| BusError::InvalidMethod {
            method: self.service.full_method_name(method),
        })?;
        call(request, actor.map(str::to_string), rpc).await
    }
}

async fn remote_call(
    context: &Context,
    method: &str,
    request: Value,
    actor: Option<String>,
    rpc: bool,
) -> Result<Value> {
    let content = context.factory().build_request(method, &request, actor.as_deref())?;

    let reply = context
        .publish_message(&content, &request_topic(method), rpc)
        .await
        .map_err(|e| BusError::PublishMessage {
            method: method.to_string(),
            reason: e.to_string(),
        })?;

    match reply {
        Some(bytes) => {
            debug!("Received response for {}", method);
            context.factory().decode_response(&bytes)?.into_result()
        }
        None => Ok(json!({})),
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("service", &self.service.name)
            .finish()
    }
}
