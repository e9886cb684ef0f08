use flowgate::BlockError;
use tower::BoxError;

/// Errors produced by the flowgate middleware.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The request was refused by a flowgate rule.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`.
    #[error(transparent)]
    Blocked(#[from] BlockError),

    /// The inner service failed after the request was admitted.
    ///
    /// The failure is also recorded against the resource as an error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Inner(BoxError),
}

impl GateError {
    /// The block decision, if the request never reached the inner service.
    pub fn as_blocked(&self) -> Option<&BlockError> {
        match self {
            Self::Blocked(err) => Some(err),
            Self::Inner(_) => None,
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for GateError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Self::Blocked(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Inner(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
