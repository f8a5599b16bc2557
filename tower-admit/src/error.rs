use crate::item::EntryId;
use crate::item::EntryStatus;

/// Errors produced by the admission coordinator.
///
/// Deferral is not an error: work that cannot run yet is returned as
/// [`Submission::Deferred`](crate::Submission::Deferred).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmitError {
    /// Both the rate limit and the deferral pool are exhausted.
    ///
    /// The work was not admitted and no pool slot was consumed.
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Deferral pool is full; request rejected")]
    PoolFull,

    /// The id is unknown: it never existed, was delivered and removed, or expired.
    ///
    /// When the `axum` feature is enabled, this converts to `404 Not Found`.
    #[error("Request {id} not found")]
    NotFound { id: EntryId },

    /// The operation is not valid for the entry's current state.
    ///
    /// When the `axum` feature is enabled, this converts to `409 Conflict`.
    #[error("Request {id} is in {current} state")]
    InvalidState { id: EntryId, current: EntryStatus },

    /// The processing service failed.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Processing failed: {0}")]
    Processing(String),

    /// The work declares a cost that no window can ever hold.
    ///
    /// When the `axum` feature is enabled, this converts to `400 Bad Request`.
    #[error("Cost {cost} exceeds limiter capacity {capacity}")]
    CostExceedsCapacity { cost: usize, capacity: usize },

    /// A polling client stopped waiting before the request reached a terminal state.
    ///
    /// When the `axum` feature is enabled, this converts to `408 Request Timeout`.
    #[error("Gave up waiting for request {id}")]
    GaveUp { id: EntryId },
}

/// Errors produced while loading an [`AdmissionConfig`](crate::AdmissionConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for AdmitError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Self::PoolFull => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::CostExceedsCapacity { .. } => StatusCode::BAD_REQUEST,
            Self::GaveUp { .. } => StatusCode::REQUEST_TIMEOUT,
        };

        (status, self.to_string()).into_response()
    }
}
