use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::auth::{Identity, Role};
use crate::error::AppError;
use crate::state::AppState;

/// Caller identity taken from an `Authorization: Bearer <token>` header.
pub struct Authenticated(pub Identity);

impl Authenticated {
    /// The caller must be the driver named in the path.
    pub fn as_driver(&self, driver_id: Uuid) -> Result<(), AppError> {
        self.0.require_role(Role::Driver)?;
        if self.0.user_id != driver_id {
            return Err(AppError::Forbidden(format!(
                "token does not belong to driver {driver_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("missing authorization header".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::Unauthorized("expected a bearer token".to_string()))?;

        state.verifier.verify(token).map(Authenticated)
    }
}
