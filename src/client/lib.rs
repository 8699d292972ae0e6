//! Client core for GridDFS: splits files into blocks on upload and
//! reassembles them, with hash verification, on download

#[macro_use]
extern crate tracing;

pub mod chunker;
pub mod client;
pub mod error;

pub use crate::client::Client;
pub use crate::error::Error;
