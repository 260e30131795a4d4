//! Service descriptors and the registry that resolves fully qualified method names.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{BusError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name: String,
    pub request_type: String,
    pub response_type: String,
}

/// A service named `<namespace>.<service>` and its methods
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn with_method(
        mut self,
        name: impl Into<String>,
        request_type: impl Into<String>,
        response_type: impl Into<String>,
    ) -> Self {
        self.methods.push(MethodDescriptor {
            name: name.into(),
            request_type: request_type.into(),
            response_type: response_type.into(),
        });
        self
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|method| method.name == name)
    }

    /// `<namespace>.<service>.<method>`
    pub fn full_method_name(&self, method: &str) -> String {
        format!("{}.{}", self.name, method)
    }

    fn validate(&self) -> Result<()> {
        let well_formed = self.name.contains('.')
            && self
                .name
                .split('.')
                .all(|word| !word.is_empty() && word != "*" && word != "#");
        if well_formed {
            Ok(())
        } else {
            Err(BusError::InvalidServiceName(self.name.clone()))
        }
    }
}

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    services: RwLock<HashMap<String, Arc<ServiceDescriptor>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<ServiceDescriptor>>> {
        self.services.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<ServiceDescriptor>>> {
        self.services.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a descriptor, replacing any previous one with the same name
    pub fn register(&self, descriptor: ServiceDescriptor) -> Result<Arc<ServiceDescriptor>> {
        descriptor.validate()?;
        let descriptor = Arc::new(descriptor);
        self.write().insert(descriptor.name.clone(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    pub fn service(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.read().get(name).cloned()
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve `<namespace>.<service>.<method>` to its service and method
    pub fn lookup_method(&self, full_name: &str) -> Option<(Arc<ServiceDescriptor>, MethodDescriptor)> {
        let (service_name, method_name) = full_name.rsplit_once('.')?;
        let service = self.service(service_name)?;
        let method = service.method(method_name)?.clone();
        Some((service, method))
    }

    /// Every request and response type referenced by a registered method
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .values()
            .flat_map(|service| {
                service
                    .methods
                    .iter()
                    .flat_map(|method| [method.request_type.clone(), method.response_type.clone()])
                    .collect::<Vec<_>>()
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> ServiceDescriptor {
        ServiceDescriptor::new("shop.orders")
            .with_method("create", "shop.CreateOrder", "shop.Order")
            .with_method("get", "shop.GetOrder", "shop.Order")
    }

    #[test]
    fn test_lookup_fully_qualified_method() {
        let registry = SchemaRegistry::new();
        registry.register(orders()).unwrap();

        let (service, method) = registry.lookup_method("shop.orders.create").unwrap();
        assert_eq!(service.name, "shop.orders");
        assert_eq!(method.request_type, "shop.CreateOrder");
        assert!(registry.lookup_method("shop.orders.delete").is_none());
        assert!(registry.lookup_method("create").is_none());
    }

    #[test]
    fn test_type_names_are_deduplicated() {
        let registry = SchemaRegistry::new();
        registry.register(orders()).unwrap();

        assert_eq!(
            registry.type_names(),
            vec!["shop.CreateOrder", "shop.GetOrder", "shop.Order"]
        );
    }

    #[test]
    fn test_rejects_malformed_service_names() {
        let registry = SchemaRegistry::new();
        for name in ["orders", "shop..orders", "shop.*", ""] {
            assert!(matches!(
                registry.register(ServiceDescriptor::new(name)),
                Err(BusError::InvalidServiceName(_))
            ));
        }
        assert!(registry.service_names().is_empty());
    }

    #[test]
    fn test_descriptor_from_json() {
        let descriptor: ServiceDescriptor = serde_json::from_str(
            r#"{
                "name": "shop.users",
                "methods": [{"name": "get", "request_type": "shop.GetUser", "response_type": "shop.User"}]
            }"#,
        )
        .unwrap();
        assert_eq!(descriptor.full_method_name("get"), "shop.users.get");
        assert!(descriptor.method("get").is_some());
    }
}
