//! Acknowledgment-tracking invocation futures for distributed entity
//! clients.
//!
//! A client issues an invocation against a server-resident entity and tracks
//! its delivery through three phases: sent, received by the server, and
//! completed. The caller blocks on an [`AckWait`] while the connection's
//! completion dispatcher thread drives its transitions; on failover the
//! connection re-arms in-flight invocations and retransmits them without the
//! blocked caller noticing.

#[macro_use]
mod utils;

mod client;
mod common;
mod server;

pub use utils::{logger_init, EntityError};

pub use client::{
    AckFrame, AckPhase, AckRequirements, AckWait, ClientConnection,
    ClientServiceFactory, ConnectionConfig, Entity, EntityClientService,
    EntityType, FrameSender, FrameSink, InvokeError, InvokeFuture, InvokeId,
};
pub use common::{
    StateDumpCollector, StateDumper, StateTree, NAMESPACE_DELIMITER,
};
pub use server::{
    AnyService, ConsumerId, ConsumerRegistry, ProviderRegistry,
    ServiceProvider, ServiceRegistry, SingletonProvider,
    SingletonProviderConfig,
};
