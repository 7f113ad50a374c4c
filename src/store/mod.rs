//! Persistence layer: libSQL-backed storage for jobs and Results.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::JobStore;
