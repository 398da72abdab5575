//! Interfaces shared by the client and server sides of an entity.

mod statedump;

pub use statedump::{
    StateDumpCollector, StateDumper, StateTree, NAMESPACE_DELIMITER,
};
