// Central Error Type

use thiserror::Error;

/// Errors surfaced by the engine's setup paths. Runtime scheduling never
/// errors: refused submissions report zero accepted and rejected
/// transitions report `false`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine already started")]
    AlreadyStarted,
}

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;
