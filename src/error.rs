use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("API error: {status} - {body}")]
    Api { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("SMTP error: {code} - {message}")]
    Delivery { code: String, message: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// Returns true for non-success responses from the billing API.
    #[must_use]
    pub const fn is_api(&self) -> bool {
        matches!(self, Self::Api { .. })
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transport(format!("request timed out: {err}"))
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Why a single usage item was left out of the report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing usage start date")]
    MissingDate,

    #[error("missing pre-tax cost")]
    MissingCost,

    #[error("invalid usage date: {0}")]
    InvalidDate(String),

    #[error("invalid cost amount: {0}")]
    InvalidCost(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        let err = AppError::Api {
            status: 403,
            body: "AuthorizationFailed".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 403 - AuthorizationFailed");
        assert!(err.is_api());
    }

    #[test]
    fn test_delivery_error_display() {
        let err = AppError::Delivery {
            code: "535".to_string(),
            message: "authentication rejected".to_string(),
        };
        assert_eq!(err.to_string(), "SMTP error: 535 - authentication rejected");
        assert!(!err.is_api());
    }
}
