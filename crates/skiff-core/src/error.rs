//! Error types for Skiff

use thiserror::Error;

/// Result type alias using Skiff's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Skiff error kinds with stable codes and operator suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Input errors (E001-E099)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Lookup errors (E100-E199)
    #[error("Not found: {0}")]
    NotFound(String),

    // Permission errors (E200-E299)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    // State errors (E300-E399)
    #[error("Conflict: {0}")]
    Conflict(String),

    // Runtime errors (E400-E499)
    #[error("Unavailable: {0}")]
    Unavailable(String),

    // Signature errors (E500-E599)
    #[error("Plugin signature is not trusted: {0}")]
    SignatureUntrusted(String),

    #[error("Plugin is not signed: {0}")]
    SignatureUnsigned(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Config vault error: {0}")]
    Vault(String),

    // Database errors (E700-E799)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "E001",
            Self::NotFound(_) => "E100",
            Self::Forbidden(_) => "E200",
            Self::Conflict(_) => "E300",
            Self::Unavailable(_) => "E400",
            Self::SignatureUntrusted(_) => "E500",
            Self::SignatureUnsigned(_) => "E501",
            Self::ConfigError(_) => "E600",
            Self::Vault(_) => "E601",
            Self::DatabaseError(_) => "E700",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Forbidden(_) => Some("skiff payment providers --all".to_string()),
            Self::Unavailable(_) => Some("skiff plugin list".to_string()),
            Self::SignatureUntrusted(_) | Self::SignatureUnsigned(_) => {
                Some("skiff plugin import <category> <plugin_id>".to_string())
            }
            Self::Vault(_) => Some("Check SKIFF_CONFIG_MASTER_KEY".to_string()),
            Self::ConfigError(_) => Some("skiff config show".to_string()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden(_))
    }
}
