//! Typed errors for the observable store.

use thiserror::Error;

/// Errors returned synchronously by store operations.
///
/// Every variant is raised before any mutation happens, so a failed call
/// leaves the tree and its listeners untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A path could not be parsed or addresses something impossible.
    #[error("Invalid path `{path}`: {reason}")]
    InvalidPath {
        /// The offending path, as given.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An argument is not acceptable for the requested operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The node handle does not refer to a live node.
    #[error("Unknown node: {0}")]
    UnknownNode(u64),

    /// A path walks through a scalar value.
    #[error("Not a container at `{0}`")]
    NotAContainer(String),

    /// The node is not reachable from any root.
    #[error("Node {0} is not reachable from any root")]
    Detached(u64),

    /// The write would make a node its own ancestor.
    #[error("Writing node {node} under node {parent} would create a cycle")]
    Cycle {
        /// The node being written.
        node: u64,
        /// The container it was written into.
        parent: u64,
    },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
