//! Error types surfaced by the worker runtime.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors produced by table, iterator, and kernel operations.
///
/// `RoutingViolation` is fatal for the worker process; everything else is
/// either encoded into a response (`NotFound`, `KernelFailure`) or returned
/// to the offending caller.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("routing violation: worker {worker} is not the owner ({owner}) of table {table} shard {shard}")]
    RoutingViolation {
        worker: i32,
        owner: i32,
        table: i32,
        shard: i32,
    },
    #[error("unknown table {0}")]
    UnknownTable(i32),
    #[error("unknown iterator {0}")]
    UnknownIterator(u32),
    #[error("shard {shard} of table {table} was destroyed")]
    InvalidShard { table: i32, shard: i32 },
    #[error("key not found")]
    NotFound,
    #[error("kernel failure: {0}")]
    KernelFailure(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Internal(String),
}

impl WorkerError {
    /// Wrap an RPC-layer failure.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        WorkerError::Transport(err.to_string())
    }

    /// Build a kernel failure from any displayable cause.
    pub fn kernel(err: impl std::fmt::Display) -> Self {
        WorkerError::KernelFailure(err.to_string())
    }
}

impl From<tonic::Status> for WorkerError {
    fn from(status: tonic::Status) -> Self {
        WorkerError::Transport(format!("{}: {}", status.code(), status.message()))
    }
}
