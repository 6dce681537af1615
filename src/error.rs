//! Error types for the storage client

use thiserror::Error;

/// Main error type for the client
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid pool bounds, malformed connection string or bad config file
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Store unreachable while warming the pool
    #[error("Connect error: {0}")]
    Connect(String),

    /// A write targeted a compressed (read-only) chunk
    #[error("Chunk compressed: {0}")]
    ChunkCompressed(String),

    /// Operation attempted after shutdown began
    #[error("Client is closed")]
    Closed,

    /// Write attempted on a read-only client
    #[error("Client is read-only")]
    ReadOnly,

    /// Read request the engine cannot evaluate (e.g. malformed regex)
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Ingestion error
    #[error("Ingestion error: {0}")]
    Ingestion(#[from] IngestionError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when this error (or the store error it wraps) reports a compressed chunk
    pub fn is_chunk_compressed(&self) -> bool {
        match self {
            Error::ChunkCompressed(_) => true,
            Error::Store(e) => e.is_chunk_compressed(),
            Error::Ingestion(IngestionError::Partial { errors, .. }) => {
                errors.iter().any(|e| e.is_chunk_compressed())
            },
            _ => false,
        }
    }

    /// Samples committed before this error was raised
    pub fn samples_written(&self) -> u64 {
        match self {
            Error::Ingestion(IngestionError::Partial { written, .. }) => *written,
            _ => 0,
        }
    }
}

/// Errors raised by a [`crate::store::Store`] implementation
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying database driver error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// No connection became available within the pool's acquire timeout
    #[error("Timed out waiting for a pooled connection")]
    PoolTimeout,

    /// The store could not be reached
    #[error("Store unreachable: {0}")]
    Unreachable(String),

    /// Insert into a compressed chunk
    #[error("Insert into compressed chunk {chunk} of {table}")]
    ChunkCompressed {
        /// Table (hypertable) the chunk belongs to
        table: String,
        /// Chunk name
        chunk: String,
    },

    /// The store lacks a capability the caller requires
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The store has been closed
    #[error("Store is closed")]
    Closed,

    /// Query could not be executed
    #[error("Query error: {0}")]
    Query(String),
}

impl StoreError {
    /// True when the store rejected a write because the chunk is compressed
    pub fn is_chunk_compressed(&self) -> bool {
        matches!(self, StoreError::ChunkCompressed { .. })
    }
}

/// Ingestion errors
#[derive(Error, Debug)]
pub enum IngestionError {
    /// One or more copy workers failed; the rest of the batch may have been written
    #[error("{written} samples written, {} worker error(s): {}", .errors.len(), join_errors(.errors))]
    Partial {
        /// Samples committed by the workers that succeeded
        written: u64,
        /// Errors reported by the workers that failed
        errors: Vec<Error>,
    },

    /// A copy worker's channel closed before it replied
    #[error("Copy worker {0} is gone")]
    WorkerGone(usize),

    /// Series that cannot be written (e.g. no metric name)
    #[error("Invalid series {0}")]
    InvalidSeries(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, Error>;
