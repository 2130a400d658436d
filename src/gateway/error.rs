//! Gateway error types and response handling

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};

use crate::error::SessionError;

/// Errors that can occur while handling a gateway request
#[derive(Debug)]
pub(crate) enum GatewayError {
    /// Session-layer failure (auth, store, backend)
    Session(SessionError),
    BodyRead(String),
    ResponseBuild(String),
}

impl From<SessionError> for GatewayError {
    fn from(err: SessionError) -> Self {
        GatewayError::Session(err)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match &self {
            GatewayError::Session(err) => match err {
                // Expired sessions get a clear re-authentication signal,
                // not a generic 500; the hosting application reacts by
                // creating a fresh session
                SessionError::InvalidToken | SessionError::ExpiredToken => {
                    (StatusCode::UNAUTHORIZED, err.to_string())
                }
                SessionError::SessionNotFound => (
                    StatusCode::UNAUTHORIZED,
                    "session expired or not found".to_string(),
                ),
                SessionError::BackendUnavailable { .. } => {
                    (StatusCode::BAD_GATEWAY, err.to_string())
                }
                SessionError::PortExhausted { .. } | SessionError::StoreUnavailable(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
                }
            },
            GatewayError::BodyRead(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            GatewayError::ResponseBuild(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        // Auth failures are expected, high-frequency churn; keep them cheap
        // and quiet. Everything else is an operational error.
        match &self {
            GatewayError::Session(err) if err.is_auth_failure() => {
                tracing::info!("Gateway auth rejection: {} - {}", status, message);
            }
            _ => {
                tracing::error!("Gateway error: {} - {}", status, message);
            }
        }

        Response::builder()
            .status(status)
            .body(Body::from(message))
            .unwrap_or_else(|_| Response::new(Body::from("Internal error building error response")))
    }
}
