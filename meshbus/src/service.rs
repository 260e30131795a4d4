use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

use crate::connection::message_handler;
use crate::context::Context;
use crate::error::{BusError, Result};
use crate::event::{EventHandler, EventListener};
use crate::listener::{ListenerStatus, MessageListener};
use crate::message::{MessageFactory, RequestEnvelope};
use crate::proxy::ServiceProxy;
use crate::schema::ServiceDescriptor;

pub const REQUEST_TOPIC_PREFIX: &str = "REQUEST";
pub const EVENTS_QUEUE_SUFFIX: &str = "Events";

/// Routing key of a request for `<namespace>.<service>.<method>`
pub fn request_topic(full_method: &str) -> String {
    format!("{}.{}", REQUEST_TOPIC_PREFIX, full_method)
}

/// Binding pattern matching every request for `service`
pub fn request_pattern(service: &str) -> String {
    format!("{}.{}.*", REQUEST_TOPIC_PREFIX, service)
}

pub type MethodFuture = BoxFuture<'static, Result<Value>>;

/// A decoded request handed to a service method
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub request: Value,
    pub actor: Option<String>,
    pub correlation_id: String,
}

/// Local implementation of a service method
pub trait ServiceMethod: Send + Sync {
    /// Start handling `call`. `None` means the implementation produced nothing to await.
    fn invoke(&self, call: MethodCall) -> Option<MethodFuture>;
}

/// Adapts an async closure into a [`ServiceMethod`]
pub struct FunctionMethod<F> {
    handler: F,
}

impl<F> FunctionMethod<F> {
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> ServiceMethod for FunctionMethod<F>
where
    F: Fn(MethodCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn invoke(&self, call: MethodCall) -> Option<MethodFuture> {
        Some(Box::pin((self.handler)(call)))
    }
}

/// A descriptor plus the methods implementing it, keyed by short name
pub struct ServiceDefinition {
    descriptor: ServiceDescriptor,
    methods: HashMap<String, Arc<dyn ServiceMethod>>,
}

impl ServiceDefinition {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            methods: HashMap::new(),
        }
    }

    pub fn method<M: ServiceMethod + 'static>(mut self, name: impl Into<String>, method: M) -> Self {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    /// Register an async closure as a method
    pub fn function<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.method(name, FunctionMethod::new(handler))
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn implementation(&self, method: &str) -> Option<Arc<dyn ServiceMethod>> {
        self.methods.get(method).cloned()
    }

    fn validate(&self) -> Result<()> {
        match self.methods.keys().find(|name| self.descriptor.method(name).is_none()) {
            Some(undeclared) => Err(BusError::InvalidMethod {
                method: self.descriptor.full_method_name(undeclared),
            }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("descriptor", &self.descriptor)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Bound on requests in flight; switches the request listener to late-ack
    pub max_concurrent: Option<u16>,
    /// Prefetch of the events listener
    pub event_prefetch: Option<u16>,
}

/// A service instance answering requests on `REQUEST.<service>.*`
pub struct MessageService {
    context: Arc<Context>,
    definition: Arc<ServiceDefinition>,
    listener: MessageListener,
    events: EventListener,
    proxy: OnceLock<ServiceProxy>,
}

impl MessageService {
    /// Register the definition's descriptor with the context schema
    pub fn new(context: Arc<Context>, definition: ServiceDefinition, options: ServiceOptions) -> Result<Self> {
        definition.validate()?;
        context.schema().register(definition.descriptor().clone())?;

        Ok(Self {
            listener: MessageListener::new(Arc::clone(context.connection()), options.max_concurrent),
            events: EventListener::new(
                Arc::clone(context.connection()),
                context.factory().clone(),
                options.event_prefetch,
            ),
            definition: Arc::new(definition),
            context,
            proxy: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    /// Set up and start the request and event listeners.
    ///
    /// Fails with `AlreadyInitialized` while the service is running.
    pub async fn init(&self) -> Result<()> {
        let name = self.name().to_string();
        if self.listener.status().await == ListenerStatus::Started {
            return Err(BusError::AlreadyInitialized(name));
        }
        let definition = Arc::clone(&self.definition);
        let factory = self.context.factory().clone();
        let handler = message_handler(move |content, correlation_id| {
            let (definition, factory) = (Arc::clone(&definition), factory.clone());
            async move {
                let response = handle_request(&definition, &factory, &content, correlation_id).await?;
                Ok::<_, BusError>(Some(response))
            }
        });

        self.listener.init(Some(handler), Some(&name)).await?;
        self.listener.subscribe([request_pattern(&name)]).await?;
        self.events
            .init(Some(&format!("{}.{}", name, EVENTS_QUEUE_SUFFIX)))
            .await?;

        self.listener.start().await?;
        self.events.start().await?;

        if self.proxy.get().is_none() {
            let proxy = ServiceProxy::new(Arc::clone(&self.context), &name)?;
            let _ = self.proxy.set(proxy);
        }

        info!("🎯 Service {} is ready", name);
        Ok(())
    }

    /// Proxy to this service, available after [`init`](Self::init)
    pub fn proxy(&self) -> Result<&ServiceProxy> {
        self.proxy.get().ok_or(BusError::NotInitialized)
    }

    pub async fn publish_event(&self, event_type: &str, content: &Value, topic: Option<&str>) -> Result<()> {
        self.context.publish_event(event_type, content, topic).await
    }

    /// Subscriptions need an initialized service
    pub async fn subscribe_event(&self, event_type: &str, handler: EventHandler, topic: Option<&str>) -> Result<()> {
        self.events.subscribe(event_type, handler, topic).await
    }

    pub async fn subscribe_all_events(&self, handler: EventHandler) -> Result<()> {
        self.events.subscribe_all(handler).await
    }

    pub async fn close(&self) -> Result<()> {
        self.listener.close().await?;
        self.events.close().await?;
        info!("Service {} closed", self.name());
        Ok(())
    }
}

impl std::fmt::Debug for MessageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageService")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Answer one request. Method failures become error envelopes; only an
/// unreadable envelope fails the delivery.
async fn handle_request(
    definition: &ServiceDefinition,
    factory: &MessageFactory,
    content: &[u8],
    correlation_id: String,
) -> Result<Vec<u8>> {
    let envelope = factory.read_request(content)?;
    debug!("Handling {} ({})", envelope.method, correlation_id);

    let outcome = invoke_method(definition, factory, &envelope, correlation_id).await;
    if let Err(e) = &outcome {
        warn!("Method {} failed: {}", envelope.method, e);
    }

    match factory.build_response(&envelope.method, outcome.as_ref()) {
        Ok(response) => Ok(response),
        Err(e) => {
            error!("Failed to encode response of {}: {}", envelope.method, e);
            factory.build_response(&envelope.method, Err(&e))
        }
    }
}

async fn invoke_method(
    definition: &ServiceDefinition,
    factory: &MessageFactory,
    envelope: &RequestEnvelope,
    correlation_id: String,
) -> Result<Value> {
    let method = definition
        .implementation(envelope.short_method())
        .ok_or_else(|| BusError::InvalidMethod {
            method: envelope.method.clone(),
        })?;
    let request = factory.request_data(envelope)?;

    let call = MethodCall {
        request,
        actor: envelope.actor.clone(),
        correlation_id,
    };
    let pending = method.invoke(call).ok_or_else(|| BusError::InvalidResult {
        method: envelope.method.clone(),
    })?;
    pending.await
}
