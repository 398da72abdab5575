//! Server-side service registry and the providers backing it.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::utils::EntityError;

use serde::Deserialize;

/// ID of a service consumer, typically one entity instance.
pub type ConsumerId = u64;

/// Type-erased shared service instance.
pub type AnyService = Arc<dyn Any + Send + Sync>;

/// Soft lookup of typed service instances. A missing service is a normal
/// outcome and yields `None`.
pub trait ServiceRegistry {
    /// Gets the service instance registered for the given type ID.
    fn get_service_any(&self, ty: TypeId) -> Option<AnyService>;

    /// Gets the service instance of type `T`, if any.
    fn get_service<T: Any + Send + Sync>(&self) -> Option<Arc<T>>
    where
        Self: Sized,
    {
        self.get_service_any(TypeId::of::<T>())
            .and_then(|s| s.downcast::<T>().ok())
    }
}

/// Provider of one or more service types, plugged into a `ProviderRegistry`
/// at server start.
pub trait ServiceProvider: Send + Sync {
    /// Name of this provider, for diagnostics.
    fn name(&self) -> &str;

    /// Initializes the provider from an optional TOML config string. Returns
    /// `Ok(false)` if the provider chose not to serve.
    fn initialize(
        &mut self,
        config_str: Option<&str>,
    ) -> Result<bool, EntityError>;

    /// Service types this provider can hand out.
    fn provided_service_types(&self) -> Vec<TypeId>;

    /// Hands out the service of type `ty` to the given consumer.
    fn get_service(
        &self,
        consumer: ConsumerId,
        ty: TypeId,
    ) -> Option<AnyService>;

    /// Releases all resources held by the provider.
    fn close(&mut self);
}

/// Registry holding all initialized service providers.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Box<dyn ServiceProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Initializes the given provider and adds it if it chooses to serve.
    /// Returns whether the provider was added.
    pub fn add_provider(
        &mut self,
        mut provider: Box<dyn ServiceProvider>,
        config_str: Option<&str>,
    ) -> Result<bool, EntityError> {
        if !provider.initialize(config_str)? {
            pf_info!("registry"; "provider '{}' declined", provider.name());
            return Ok(false);
        }
        pf_debug!("registry"; "provider '{}' added", provider.name());
        self.providers.push(provider);
        Ok(true)
    }

    /// Returns the view of this registry seen by the given consumer.
    pub fn for_consumer(&self, consumer: ConsumerId) -> ConsumerRegistry<'_> {
        ConsumerRegistry {
            consumer,
            providers: &self.providers,
        }
    }

    /// Closes and removes all providers.
    pub fn close(&mut self) {
        for mut provider in self.providers.drain(..) {
            provider.close();
        }
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| p.name()))
            .finish()
    }
}

/// Per-consumer view of a `ProviderRegistry`.
pub struct ConsumerRegistry<'a> {
    consumer: ConsumerId,
    providers: &'a [Box<dyn ServiceProvider>],
}

impl ServiceRegistry for ConsumerRegistry<'_> {
    fn get_service_any(&self, ty: TypeId) -> Option<AnyService> {
        self.providers
            .iter()
            .filter(|p| p.provided_service_types().contains(&ty))
            .find_map(|p| p.get_service(self.consumer, ty))
    }
}

/// Configuration parameters struct of `SingletonProvider`.
#[derive(Debug, Deserialize)]
pub struct SingletonProviderConfig {
    /// Whether the provider serves at all.
    pub enabled: bool,
}

impl Default for SingletonProviderConfig {
    fn default() -> Self {
        SingletonProviderConfig { enabled: true }
    }
}

/// Provider handing out one shared instance of `T` to every consumer.
pub struct SingletonProvider<T: Any + Send + Sync> {
    name: String,
    service: Option<Arc<T>>,
}

impl<T: Any + Send + Sync> SingletonProvider<T> {
    /// Creates a provider of the given instance.
    pub fn new(name: impl Into<String>, service: T) -> Self {
        SingletonProvider {
            name: name.into(),
            service: Some(Arc::new(service)),
        }
    }
}

impl<T: Any + Send + Sync> ServiceProvider for SingletonProvider<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(
        &mut self,
        config_str: Option<&str>,
    ) -> Result<bool, EntityError> {
        let config =
            parsed_config!(config_str => SingletonProviderConfig; enabled)?;
        Ok(config.enabled && self.service.is_some())
    }

    fn provided_service_types(&self) -> Vec<TypeId> {
        vec![TypeId::of::<T>()]
    }

    fn get_service(
        &self,
        consumer: ConsumerId,
        ty: TypeId,
    ) -> Option<AnyService> {
        if ty != TypeId::of::<T>() {
            return None;
        }
        pf_trace!(self.name; "service handed to consumer {}", consumer);
        self.service.clone().map(|s| s as AnyService)
    }

    fn close(&mut self) {
        self.service = None;
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Clock(u64);

    #[derive(Debug)]
    struct Counter;

    #[test]
    fn get_registered_service() -> Result<(), EntityError> {
        let mut registry = ProviderRegistry::new();
        let added = registry.add_provider(
            Box::new(SingletonProvider::new("clock", Clock(7))),
            None,
        )?;
        assert!(added);
        let view = registry.for_consumer(1);
        assert_eq!(view.get_service::<Clock>().as_deref(), Some(&Clock(7)));
        Ok(())
    }

    #[test]
    fn missing_service_is_none() -> Result<(), EntityError> {
        let mut registry = ProviderRegistry::new();
        registry.add_provider(
            Box::new(SingletonProvider::new("clock", Clock(7))),
            None,
        )?;
        let view = registry.for_consumer(1);
        assert!(view.get_service::<Counter>().is_none());
        Ok(())
    }

    #[test]
    fn shared_across_consumers() -> Result<(), EntityError> {
        let mut registry = ProviderRegistry::new();
        registry.add_provider(
            Box::new(SingletonProvider::new("clock", Clock(1))),
            None,
        )?;
        let a = registry.for_consumer(1).get_service::<Clock>();
        let b = registry.for_consumer(2).get_service::<Clock>();
        match (a, b) {
            (Some(a), Some(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("service missing for some consumer"),
        }
        Ok(())
    }

    #[test]
    fn disabled_provider_declines() -> Result<(), EntityError> {
        let mut registry = ProviderRegistry::new();
        let added = registry.add_provider(
            Box::new(SingletonProvider::new("clock", Clock(1))),
            Some("enabled = false"),
        )?;
        assert!(!added);
        assert!(registry.for_consumer(1).get_service::<Clock>().is_none());
        Ok(())
    }

    #[test]
    fn invalid_provider_config() {
        let mut registry = ProviderRegistry::new();
        assert!(registry
            .add_provider(
                Box::new(SingletonProvider::new("clock", Clock(1))),
                Some("nonsense = 1"),
            )
            .is_err());
    }

    #[test]
    fn closed_registry_is_empty() -> Result<(), EntityError> {
        let mut registry = ProviderRegistry::new();
        registry.add_provider(
            Box::new(SingletonProvider::new("clock", Clock(1))),
            None,
        )?;
        registry.close();
        assert!(registry.for_consumer(1).get_service::<Clock>().is_none());
        Ok(())
    }
}
