//! Error taxonomy shared by the endpoints, the transport and the provider.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::cache::CacheError;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// No session, or the session does not resolve to a principal.
    #[error("unauthenticated")]
    Unauthenticated,
    /// Authenticated, but not a member of the document's scope.
    #[error("forbidden")]
    Forbidden,
    /// Document (or its scope) does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Empty or malformed request.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// A feed or write call could not complete.
    #[error("transport failure: {0}")]
    TransportFailure(String),
    /// Server-side storage failed while serving an otherwise valid request.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl SyncError {
    /// Only transport failures are retried; everything else is terminal for
    /// the call that produced it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransportFailure(_))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            SyncError::Unauthenticated => StatusCode::UNAUTHORIZED,
            SyncError::Forbidden => StatusCode::FORBIDDEN,
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            SyncError::TransportFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map a non-success HTTP status returned by the server back into the
    /// taxonomy.
    pub fn from_status(status: StatusCode, body: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => SyncError::Unauthenticated,
            StatusCode::FORBIDDEN => SyncError::Forbidden,
            StatusCode::NOT_FOUND => SyncError::NotFound(body),
            StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => {
                SyncError::InvalidPayload(body)
            }
            other => SyncError::TransportFailure(format!("server responded {other}: {body}")),
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<CacheError> for SyncError {
    fn from(e: CacheError) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::UnknownTable(name) => SyncError::NotFound(format!("table {name}")),
            ProtocolError::Deserialization(msg) => SyncError::InvalidPayload(msg),
            other => SyncError::TransportFailure(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::TransportFailure(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(response) => {
                let status = StatusCode::from_u16(response.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                let body = response
                    .body()
                    .as_ref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                SyncError::from_status(status, body)
            }
            other => SyncError::TransportFailure(other.to_string()),
        }
    }
}
