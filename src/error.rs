use thiserror::Error;

/// Failures surfaced by the dashboard data layer. None of them are fatal;
/// callers report them as notifications and carry on.
#[derive(Debug, Error)]
pub enum DashboardError {
    /// Transport failure or non-2xx response
    #[error("network error: {0}")]
    Network(String),

    /// A required field was empty
    #[error("{0}")]
    Validation(String),

    #[error("no data to export")]
    NoData,

    /// Malformed payload or value
    #[error("parse error: {0}")]
    Parse(String),

    #[error("sample {0} not found")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for DashboardError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            DashboardError::Parse(err.to_string())
        } else {
            DashboardError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DashboardError {
    fn from(err: serde_json::Error) -> Self {
        DashboardError::Parse(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DashboardError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        DashboardError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DashboardError>;
