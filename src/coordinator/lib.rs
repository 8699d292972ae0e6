//! Coordinator for GridDFS: owns the namespace, the metadata store and
//! the block placement pipeline

#[macro_use]
extern crate tracing;

pub mod error;
pub mod schema;
pub mod store;

pub mod coordinator;
pub mod workers;

pub use crate::coordinator::Coordinator;
pub use crate::error::Error;
