//! Persistent store.

mod backend;
mod database;
mod index;
mod log;
mod memory;
pub mod migrations;

pub use backend::{record_footprint, StorageBackend, WriteBatch, WriteOp};
pub use database::{Database, RetryConfig};
pub use index::EditIndex;
pub use log::LogBackend;
pub use memory::{Fault, MemoryBackend};
