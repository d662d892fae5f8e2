//! Error types for the mailsift engine.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Learning error: {0}")]
    Learning(#[from] LearningError),

    #[error("Cleanup error: {0}")]
    Cleanup(#[from] CleanupError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse setting {key}: {message}")]
    ParseError { key: String, message: String },
}

/// Database-related errors.
///
/// `Constraint` and `NotFound` are the data-integrity family: rejected at
/// the write boundary and surfaced to the caller, never coerced. A query
/// failure while persisting a Decision or ReviewItem is fatal for that
/// email's cycle — the append-only audit trail must never have silent gaps.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Transient adapter failures (classifier or LLM backend).
///
/// The router treats all of these as a decline: retry with backoff where
/// the adapter supports it, then escalate to the next tier.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Adapter {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Adapter {name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("Adapter {name} returned an invalid response: {reason}")]
    InvalidResponse { name: String, reason: String },

    #[error("No active model for classifier type {0}")]
    NoActiveModel(String),
}

/// LLM backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    #[error("LLM returned non-success status {0}")]
    Status(u16),

    #[error("Failed to parse LLM response: {0}")]
    Parse(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Learning-subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum LearningError {
    #[error(
        "Model {candidate} underperforms active {active}: {candidate_accuracy:.3} vs {active_accuracy:.3}"
    )]
    Regression {
        candidate: String,
        active: String,
        candidate_accuracy: f64,
        active_accuracy: f64,
    },

    #[error("Training failed: {0}")]
    TrainingFailed(String),

    #[error("Cannot induce rule: {0}")]
    InvalidRule(String),
}

/// Cleanup/deletion errors.
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("Remote deletion failed for {message_id}: {reason}")]
    RemoteDelete { message_id: String, reason: String },

    #[error("Restoration deadline passed for {message_id} at {deadline}")]
    DeadlinePassed { message_id: String, deadline: String },

    #[error("Remote restore failed for {message_id}: {reason}")]
    RemoteRestore { message_id: String, reason: String },

    #[error("Cleanup operation {0} not found")]
    OperationNotFound(uuid::Uuid),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
