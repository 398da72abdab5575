//! Server side services consumed by entities.

mod registry;

pub use registry::{
    AnyService, ConsumerId, ConsumerRegistry, ProviderRegistry,
    ServiceProvider, ServiceRegistry, SingletonProvider,
    SingletonProviderConfig,
};
