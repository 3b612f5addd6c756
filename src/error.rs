//! Error taxonomy shared across the storage engines, internal clients, and
//! HTTP handlers.
//!
//! Storage and engine layers return typed errors; the handlers map each
//! variant onto the JSON envelope status (`dto`). `NotFound` and
//! `InvalidVersion` are domain outcomes that travel as envelope statuses with
//! HTTP 200; everything else surfaces as a transport-level 500.

use thiserror::Error;

/// Errors produced by the rate and alloc storage engines.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No quota has been registered for the requested (namespace, resource).
    #[error("not found")]
    NotFound,

    /// Optimistic-concurrency check failed: the caller's expected version
    /// does not match the stored version.
    #[error("invalid version")]
    InvalidVersion,

    #[error("requested more tokens than available capacity")]
    TokensExceedCapacity,

    #[error("storage is shut down")]
    Closed,

    #[error("corrupt record for key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("raft error: {0}")]
    Raft(String),

    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("store error: {0}")]
    Store(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
}

impl StorageError {
    /// Raft command results carry errors as plain strings; rebuild the typed
    /// variants from the wire text so callers see the same taxonomy on every
    /// back-end.
    pub fn from_wire(msg: &str) -> Self {
        if msg.contains("invalid version") {
            StorageError::InvalidVersion
        } else if msg.contains("not found") {
            StorageError::NotFound
        } else {
            StorageError::Raft(msg.to_string())
        }
    }
}

/// Errors produced by the typed internal HTTP clients.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Every candidate address failed at the transport level.
    #[error("all attempts failed")]
    AllAttemptsFailed,

    /// One attempt failed at the transport level: connection, non-2xx
    /// status, or an unparseable body. Falls through to the next attempt.
    #[error("transport: {0}")]
    Transport(String),

    /// A back-end answered with a well-formed domain error. Surfaced
    /// immediately, without trying further addresses.
    #[error("{0}")]
    Domain(StorageError),

    #[error("no addresses to try")]
    NoAddresses,
}

/// Configuration errors. Fatal at startup only.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("{0} is not a runnable target")]
    InvalidTarget(String),

    #[error("{0} backend is not supported")]
    UnsupportedBackend(String),

    #[error("{0} algorithm is not supported")]
    UnsupportedAlgorithm(String),

    #[error("unit {0} is not supported")]
    UnsupportedUnit(String),

    #[error("invalid duration '{value}': {message}")]
    InvalidDuration { value: String, message: String },

    #[error("invalid configuration: {0}")]
    Validation(String),
}
