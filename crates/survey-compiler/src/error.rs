//! Compiler error types
//!
//! Errors are classified by how far they are allowed to travel:
//!
//! - [`CompilerError::Critical`] and [`CompilerError::ZeroSurvivors`] abort the run and are
//!   persisted as a failed status by the controller.
//! - [`CompilerError::Shard`] never escapes the per-shard loops; it is logged and counted.
//! - [`CompilerError::Artifact`] aborts one export artifact, not its siblings.

use thiserror::Error;

/// Result type alias for compiler operations
pub type Result<T> = std::result::Result<T, CompilerError>;

#[derive(Error, Debug)]
pub enum CompilerError {
    #[error("Critical failure: {0}")]
    Critical(String),

    #[error("No geometries survived repair for {theme} {year}")]
    ZeroSurvivors { theme: String, year: i32 },

    #[error("Shard '{shard}' failed: {message}")]
    Shard { shard: String, message: String },

    #[error("Artifact '{artifact}' rejected: {reason}")]
    Artifact { artifact: String, reason: String },

    #[error("Invalid identifier '{value}': {reason}")]
    InvalidIdentifier { value: String, reason: String },

    #[error("Invalid geometry: {0}")]
    Geometry(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] survey_common::SurveyError),
}

impl CompilerError {
    pub fn critical(message: impl Into<String>) -> Self {
        Self::Critical(message.into())
    }

    pub fn shard(shard: impl Into<String>, message: impl ToString) -> Self {
        Self::Shard {
            shard: shard.into(),
            message: message.to_string(),
        }
    }

    pub fn artifact(artifact: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Artifact {
            artifact: artifact.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_identifier(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error must terminate the run
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Critical(_) | Self::ZeroSurvivors { .. } | Self::InvalidIdentifier { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(CompilerError::critical("no shards").is_critical());
        assert!(CompilerError::ZeroSurvivors {
            theme: "current-state".into(),
            year: 2025
        }
        .is_critical());
        assert!(!CompilerError::shard("musi", "connection refused").is_critical());
        assert!(!CompilerError::artifact("x.zip", "missing .dbf").is_critical());
    }

    #[test]
    fn test_display() {
        let err = CompilerError::shard("musi", "connection refused");
        assert_eq!(err.to_string(), "Shard 'musi' failed: connection refused");
    }
}
