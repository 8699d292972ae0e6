//! Storage node for GridDFS: keeps blocks on local disk, polices its
//! own capacity, serves direct block requests and emits heartbeats

#[macro_use]
extern crate tracing;

pub mod manager;
pub mod policy;

pub mod node;
pub mod workers;

pub use crate::node::StorageNode;
