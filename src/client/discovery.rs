//! Discovery of the client-side service implementation of an entity type.

use std::any::{self, TypeId};
use std::fmt;

use crate::utils::EntityError;

/// Client-side handle of a server-resident entity.
pub trait Entity: Send + 'static {
    /// Releases the client-side resources of this entity.
    fn close(&mut self) {}
}

/// Descriptor of an entity type.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct EntityType {
    id: TypeId,
    name: &'static str,
}

impl EntityType {
    /// Descriptor of entity type `E`.
    pub fn of<E: Entity>() -> Self {
        EntityType {
            id: TypeId::of::<E>(),
            name: any::type_name::<E>(),
        }
    }

    /// Full type name of the entity.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Client-side service implementation of one or more entity types.
pub trait EntityClientService: Send + Sync {
    /// Returns whether this service handles the given entity type.
    fn handles_entity_type(&self, ty: EntityType) -> bool;

    /// Name of this service, for diagnostics.
    fn name(&self) -> &str;
}

/// Explicit registry of client services, populated at process start and
/// queried by entity type.
#[derive(Default)]
pub struct ClientServiceFactory {
    services: Vec<Box<dyn EntityClientService>>,
}

impl ClientServiceFactory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client service. Services are queried in registration
    /// order and the first match wins.
    pub fn register(&mut self, service: Box<dyn EntityClientService>) {
        pf_debug!(
            "discovery";
            "registered client service '{}'",
            service.name()
        );
        self.services.push(service);
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns whether no service is registered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Finds the client service handling entity type `E`. A missing service
    /// is a configuration fault and returns an error.
    pub fn creation_service_for_type<E: Entity>(
        &self,
    ) -> Result<&dyn EntityClientService, EntityError> {
        self.creation_service_for(EntityType::of::<E>())
    }

    /// Untyped variant of `creation_service_for_type()`.
    pub fn creation_service_for(
        &self,
        ty: EntityType,
    ) -> Result<&dyn EntityClientService, EntityError> {
        match self.services.iter().find(|s| s.handles_entity_type(ty)) {
            Some(service) => Ok(service.as_ref()),
            None => logged_err!("discovery"; "can't handle entity type {}", ty),
        }
    }
}

impl fmt::Debug for ClientServiceFactory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.services.iter().map(|s| s.name()))
            .finish()
    }
}
