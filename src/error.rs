use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// What a bus consumer does with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Requeue,
    DeadLetter,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Requeue => "requeue",
            Disposition::DeadLetter => "dead_letter",
        }
    }
}

impl AppError {
    /// Only infrastructure failures are worth another delivery attempt;
    /// a payload that failed validation will fail the same way forever.
    pub fn disposition(&self) -> Disposition {
        match self {
            AppError::Unavailable(_) => Disposition::Requeue,
            _ => Disposition::DeadLetter,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition() == Disposition::Requeue
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if storage_is_unreachable(&err) {
            AppError::Unavailable(format!("storage: {err}"))
        } else {
            AppError::Internal(format!("storage: {err}"))
        }
    }
}

/// Connection-level failures clear up on their own; decode errors, missing
/// rows or columns and constraint violations repeat on every attempt.
fn storage_is_unreachable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => true,
        // SQLSTATE 08: connection exception, 57P: operator intervention (shutdown, crash recovery).
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("08") || code.starts_with("57P")),
        _ => false,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::RateLimited(msg) => (StatusCode::TOO_MANY_REQUESTS, msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::{AppError, Disposition};

    #[test]
    fn only_unavailable_is_requeued() {
        assert_eq!(
            AppError::Unavailable("db down".into()).disposition(),
            Disposition::Requeue
        );
        assert_eq!(
            AppError::BadRequest("bad json".into()).disposition(),
            Disposition::DeadLetter
        );
        assert_eq!(
            AppError::NotFound("ride".into()).disposition(),
            Disposition::DeadLetter
        );
        assert_eq!(
            AppError::Conflict("taken".into()).disposition(),
            Disposition::DeadLetter
        );
    }

    #[test]
    fn unreachable_storage_is_requeued() {
        for err in [
            sqlx::Error::PoolTimedOut,
            sqlx::Error::PoolClosed,
            sqlx::Error::WorkerCrashed,
            sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer",
            )),
        ] {
            let label = format!("{err:?}");
            assert_eq!(
                AppError::from(err).disposition(),
                Disposition::Requeue,
                "{label}"
            );
        }
    }

    #[test]
    fn permanent_storage_errors_are_dead_lettered() {
        for err in [
            sqlx::Error::RowNotFound,
            sqlx::Error::ColumnNotFound("status".into()),
            sqlx::Error::TypeNotFound {
                type_name: "geography".into(),
            },
            sqlx::Error::Protocol("unexpected message".into()),
        ] {
            let label = format!("{err:?}");
            let app = AppError::from(err);
            assert!(matches!(app, AppError::Internal(_)), "{label}");
            assert_eq!(app.disposition(), Disposition::DeadLetter, "{label}");
        }
    }
}
