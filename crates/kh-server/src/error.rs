//! Top-level error taxonomy (§7), mapped to HTTP status at the boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("database error: {0}")]
    Db(#[from] kh_db::DbError),

    #[error("file store error: {0}")]
    Store(#[from] kh_store::FileStoreError),

    #[error(transparent)]
    Protocol(#[from] kh_protocol::ProtocolError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("auth failure: {0}")]
    AuthFailure(String),

    #[error("state conflict: {0}")]
    Conflict(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    reason: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, reason) = match &self {
            ServerError::Db(kh_db::DbError::NotFound(_)) | ServerError::NotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ServerError::Db(kh_db::DbError::Conflict(reason)) | ServerError::Conflict(reason) => {
                (StatusCode::CONFLICT, reason.clone())
            }
            ServerError::Db(kh_db::DbError::InvalidInput(_))
            | ServerError::InvalidInput(_)
            | ServerError::Protocol(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::AuthFailure(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Store(_) | ServerError::Db(_) | ServerError::Fatal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };
        (status, Json(ErrorBody { reason })).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
