//! Probe error types

use thiserror::Error;

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Log source error: {0}")]
    Log(String),
}

impl ProbeError {
    /// Errors that a later attempt with the same inputs cannot fix
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Api { status, .. } => matches!(status, 400 | 401 | 403 | 404),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failures_are_permanent() {
        let err = ProbeError::Api { status: 401, body: "bad secret".into() };
        assert!(err.is_permanent());
        assert_eq!(err.to_string(), "API returned 401: bad secret");
        assert!(!ProbeError::Api { status: 502, body: String::new() }.is_permanent());
        assert!(!ProbeError::Log("x".into()).is_permanent());
    }
}
