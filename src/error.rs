//! Error types for the loan match advisor

use thiserror::Error;

/// Result type alias for advisor operations
pub type Result<T> = std::result::Result<T, AdvisorError>;

#[derive(Error, Debug)]
pub enum AdvisorError {

    // =============================
    // Boundary Errors
    // =============================

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // =============================
    // Recoverable Errors
    // =============================

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdvisorError {
    /// HTTP status code surfaced by the handlers for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            AdvisorError::Validation(_) => 400,
            AdvisorError::Authentication(_) => 401,
            AdvisorError::NotFound(_) => 404,
            AdvisorError::Conflict(_) => 409,
            _ => 500,
        }
    }

    /// Short label used in error bodies (`"type"` field).
    pub fn kind(&self) -> &'static str {
        match self {
            AdvisorError::Validation(_) => "ValidationError",
            AdvisorError::Authentication(_) => "AuthenticationFailure",
            AdvisorError::NotFound(_) => "NotFound",
            AdvisorError::Conflict(_) => "Conflict",
            AdvisorError::ExternalService(_) => "ExternalServiceError",
            AdvisorError::DataIntegrity(_) => "DataIntegrityError",
            AdvisorError::Persistence(_) | AdvisorError::Database(_) => "PersistenceError",
            AdvisorError::Config(_) => "ConfigurationError",
            AdvisorError::Serialization(_) => "SerializationError",
            AdvisorError::Http(_) => "HttpError",
            AdvisorError::Io(_) => "IoError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(AdvisorError::Validation("x".into()).status_code(), 400);
        assert_eq!(AdvisorError::Authentication("x".into()).status_code(), 401);
        assert_eq!(AdvisorError::NotFound("x".into()).status_code(), 404);
        assert_eq!(AdvisorError::Conflict("x".into()).status_code(), 409);
        assert_eq!(AdvisorError::ExternalService("x".into()).status_code(), 500);
    }
}
