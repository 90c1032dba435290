use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Passenger,
    Driver,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Passenger => "PASSENGER",
            Role::Driver => "DRIVER",
            Role::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASSENGER" => Ok(Role::Passenger),
            "DRIVER" => Ok(Role::Driver),
            "ADMIN" => Ok(Role::Admin),
            other => Err(AppError::Unauthorized(format!("unknown role: {other}"))),
        }
    }
}

/// Who is on the other end of a request or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

impl Identity {
    pub fn require_role(&self, role: Role) -> Result<(), AppError> {
        if self.role == role {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "role {} required, got {}",
                role, self.role
            )))
        }
    }
}

pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AppError>;
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 tokens shared by every service.
#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
}

impl JwtVerifier {
    pub fn new(secret: &str, issuer: impl Into<String>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
        }
    }

    pub fn issue(
        &self,
        user_id: Uuid,
        role: Role,
        ttl: chrono::Duration,
    ) -> Result<String, AppError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            role,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| AppError::Internal(format!("failed to sign token: {err}")))
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AppError> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.issuer]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|err| AppError::Unauthorized(format!("invalid token: {err}")))?;

        Ok(Identity {
            user_id: data.claims.sub,
            role: data.claims.role,
        })
    }
}
