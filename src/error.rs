//! Error types for relayflow.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Configuration-related errors. Raised at construction time, never mid-run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unsupported {kind} type: {value}")]
    UnsupportedType { kind: String, value: String },
}

impl ConfigError {
    pub(crate) fn missing(key: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            key: key.into(),
            hint: hint.into(),
        }
    }

    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

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

/// Channel (source/destination backend) errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} fetch failed: {reason}")]
    FetchFailed { name: String, reason: String },

    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Language-model errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Model {model} request failed: {reason}")]
    RequestFailed { model: String, reason: String },

    #[error("Model {model} timed out after {timeout:?}")]
    Timeout { model: String, timeout: Duration },

    #[error("Invalid response from {model}: {reason}")]
    InvalidResponse { model: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline-stage errors. Stages convert these into sentinel values
/// before they cross a Source/Processor/Destination boundary.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Empty batch: {0}")]
    EmptyBatch(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Workflow construction and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow builder is missing {0}")]
    Incomplete(&'static str),

    #[error("Workflow {id} not found")]
    NotFound { id: String },

    #[error("Interval of {secs}s is below the {min}s floor")]
    IntervalTooShort { secs: u64, min: u64 },

    #[error("Interval of {secs}s exceeds the {max}s ceiling")]
    IntervalTooLong { secs: u64, max: u64 },

    #[error("Workflow {id} configuration does not match type {expected}")]
    TypeMismatch { id: String, expected: String },

    #[error("Supervisor is stopped")]
    SupervisorStopped,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
