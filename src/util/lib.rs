//! Crate containing common functions and types used in GridDFS

#[macro_use]
extern crate tracing;

pub mod background;
pub mod config;
pub mod data;
pub mod error;
pub mod time;
