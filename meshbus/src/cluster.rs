use std::sync::Arc;
use tracing::info;

use crate::context::Context;
use crate::error::Result;
use crate::service::MessageService;

/// Hosts several instances of several services on one shared [`Context`].
///
/// Instances of the same service consume from the same queue and so share its load.
pub struct ServiceCluster {
    context: Arc<Context>,
    services: Vec<MessageService>,
}

impl ServiceCluster {
    pub fn new(context: Arc<Context>) -> Self {
        Self {
            context,
            services: Vec::new(),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Build `count` instances (at least one) with `factory`
    pub fn use_service<F>(&mut self, factory: F, count: usize) -> Result<&mut Self>
    where
        F: Fn(Arc<Context>) -> Result<MessageService>,
    {
        for _ in 0..count.max(1) {
            let service = factory(Arc::clone(&self.context))?;
            self.services.push(service);
        }
        Ok(self)
    }

    /// Initialize the context, connecting to `url` if needed, then every instance
    pub async fn init(&self, url: &str) -> Result<()> {
        self.context.init(url).await?;
        for service in &self.services {
            service.init().await?;
        }
        info!("🚀 Cluster running {} service instances", self.services.len());
        Ok(())
    }

    /// Distinct names of the hosted services, sorted
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|s| s.name().to_string()).collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn instance_count(&self, service_name: &str) -> usize {
        self.services.iter().filter(|s| s.name() == service_name).count()
    }

    pub fn services(&self) -> &[MessageService] {
        &self.services
    }

    /// Close every instance, then the context
    pub async fn close(&self) -> Result<()> {
        for service in &self.services {
            service.close().await?;
        }
        self.context.close().await
    }
}

impl std::fmt::Debug for ServiceCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCluster")
            .field("services", &self.service_names())
            .field("instances", &self.services.len())
            .finish()
    }
}
