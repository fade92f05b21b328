//! Persistence layer: libSQL-backed workflow definitions and settings.

pub mod libsql_backend;
#[cfg(test)]
pub(crate) mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::WorkflowStore;
