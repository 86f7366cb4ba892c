//! ProxySQL Admin Interface
//!
//! Trait-based abstraction over the admin connection, following the same
//! shape as the object store layer: boxed futures, no async-trait.
//!
//! Implementations:
//! - `SimulatedAdmin`: in-memory Topology Store for unit tests and DST
//! - `MysqlAdmin`: MySQL wire protocol (feature `mysql`)

pub mod statements;
mod simulated;
#[cfg(feature = "mysql")]
mod mysql;

pub use simulated::{AdminFault, SimulatedAdmin, TopologyRow};
#[cfg(feature = "mysql")]
pub use mysql::MysqlAdmin;

use std::future::Future;
use std::pin::Pin;

/// Error type for admin interface operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminError {
    /// The connection was closed from this side
    Closed,
    /// Could not reach or authenticate against the admin interface
    Connection(String),
    /// The admin interface rejected the statement
    Statement(String),
}

impl std::fmt::Display for AdminError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdminError::Closed => write!(f, "admin connection closed"),
            AdminError::Connection(msg) => write!(f, "admin connection error: {}", msg),
            AdminError::Statement(msg) => write!(f, "SQL error: {}", msg),
        }
    }
}

impl std::error::Error for AdminError {}

pub type AdminFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AdminError>> + Send + 'a>>;

/// Request/response executor over a single long-lived admin connection.
///
/// Statements are executed one at a time; implementations serialize
/// concurrent callers rather than pipelining.
pub trait AdminExecutor: Send + Sync + 'static {
    /// Execute a statement, returning the affected row count
    fn execute<'a>(&'a self, statement: &'a str) -> AdminFuture<'a, u64>;

    /// Run a query returning a single integer cell (`None` for NULL or no rows)
    fn query_scalar<'a>(&'a self, query: &'a str) -> AdminFuture<'a, Option<i64>>;

    /// Round-trip check of the connection
    fn ping(&self) -> AdminFuture<'_, ()>;

    /// Close the connection; later calls fail with `AdminError::Closed`
    fn close(&self) -> AdminFuture<'_, ()>;
}
