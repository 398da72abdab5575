//! Client side of entity invocations: the acknowledgment future, the
//! connection driving it, and client service discovery.

mod future;
mod ackwait;
mod dispatch;
mod connection;
mod discovery;

pub use future::{InvokeError, InvokeFuture};
pub use ackwait::{AckPhase, AckRequirements, AckWait, InvokeId};
pub use dispatch::{AckFrame, FrameSender};
pub use connection::{ClientConnection, ConnectionConfig, FrameSink};
pub use discovery::{
    ClientServiceFactory, Entity, EntityClientService, EntityType,
};
