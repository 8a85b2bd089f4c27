use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Reasons the Auth Gate turns a request away.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Unknown email or wrong password. Both look the same to the caller.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("missing or unknown session")]
    MissingSession,

    #[error("session expired")]
    SessionExpired,

    /// Authenticated, but not allowed to perform the operation.
    #[error("forbidden: {0}")]
    Forbidden(String),
}

#[derive(Debug, Error)]
pub enum ParkingError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authorization error: {0}")]
    Auth(#[from] AuthError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The store itself failed. Details are logged, never sent to clients.
    #[error("storage error: {0}")]
    Storage(String),
}

impl ParkingError {
    pub fn kind(&self) -> &'static str {
        match self {
            ParkingError::Validation(_) => "validation",
            ParkingError::Auth(_) => "auth",
            ParkingError::Conflict(_) => "conflict",
            ParkingError::NotFound(_) => "not_found",
            ParkingError::Storage(_) => "storage",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ParkingError::Validation(_) => StatusCode::BAD_REQUEST,
            ParkingError::Auth(AuthError::Forbidden(_)) => StatusCode::FORBIDDEN,
            ParkingError::Auth(_) => StatusCode::UNAUTHORIZED,
            ParkingError::Conflict(_) => StatusCode::CONFLICT,
            ParkingError::NotFound(_) => StatusCode::NOT_FOUND,
            ParkingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl IntoResponse for ParkingError {
    fn into_response(self) -> Response {
        let message = match &self {
            ParkingError::Storage(err) => {
                error!(%err, "Storage failure while handling request");
                "Internal server error".to_string()
            }
            ParkingError::Validation(msg)
            | ParkingError::Conflict(msg)
            | ParkingError::NotFound(msg) => msg.clone(),
            ParkingError::Auth(err) => err.to_string(),
        };

        let body = ErrorBody {
            kind: self.kind(),
            message,
        };
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<DieselError> for ParkingError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => ParkingError::NotFound("record does not exist".into()),
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                ParkingError::Conflict(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
                ParkingError::NotFound(info.message().to_string())
            }
            other => ParkingError::Storage(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for ParkingError {
    fn from(err: validator::ValidationErrors) -> Self {
        ParkingError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case(ParkingError::Validation("bad window".into()), StatusCode::BAD_REQUEST, "validation")]
    #[test_case(ParkingError::Auth(AuthError::InvalidCredentials), StatusCode::UNAUTHORIZED, "auth")]
    #[test_case(ParkingError::Auth(AuthError::SessionExpired), StatusCode::UNAUTHORIZED, "auth")]
    #[test_case(ParkingError::Auth(AuthError::Forbidden("admin only".into())), StatusCode::FORBIDDEN, "auth")]
    #[test_case(ParkingError::Conflict("taken".into()), StatusCode::CONFLICT, "conflict")]
    #[test_case(ParkingError::NotFound("slot 7".into()), StatusCode::NOT_FOUND, "not_found")]
    #[test_case(ParkingError::Storage("disk on fire".into()), StatusCode::INTERNAL_SERVER_ERROR, "storage")]
    fn test_error_kind_and_status(err: ParkingError, status: StatusCode, kind: &str) {
        assert_eq!(err.kind(), kind);
        assert_eq!(err.into_response().status(), status);
    }

    #[test]
    fn test_diesel_not_found_maps_to_not_found() {
        let err = ParkingError::from(DieselError::NotFound);
        assert!(matches!(err, ParkingError::NotFound(_)));
    }

    #[test]
    fn test_diesel_other_errors_map_to_storage() {
        let err = ParkingError::from(DieselError::RollbackTransaction);
        assert!(matches!(err, ParkingError::Storage(_)));
    }
}
