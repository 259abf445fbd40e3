use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{InstitutionId, ProfileId, Role, RoleKind},
    error::{ApiError, ErrorCode},
    protocol::SessionView,
};
use storage::StoredProfile;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub secret: String,
    pub ttl_seconds: i64,
}

/// The signed-in caller, passed explicitly into every workflow call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub profile_id: ProfileId,
    pub email: String,
    pub full_name: String,
    pub role: Role,
}

impl Session {
    pub fn from_profile(profile: StoredProfile) -> Result<Self, ApiError> {
        let role = match profile.role {
            RoleKind::Student => Role::Student,
            RoleKind::CollegeAdmin => Role::CollegeAdmin {
                institution_id: profile.institution_id.ok_or_else(|| {
                    ApiError::forbidden("college admin profile is not linked to an institution")
                })?,
            },
            RoleKind::Company => Role::Company,
        };
        Ok(Self {
            profile_id: profile.profile_id,
            email: profile.email,
            full_name: profile.full_name,
            role,
        })
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            profile_id: self.profile_id,
            email: self.email.clone(),
            full_name: self.full_name.clone(),
            role: self.role,
        }
    }

    /// Institution the caller administers. Only college admins have one.
    pub fn admin_institution(&self) -> Result<InstitutionId, ApiError> {
        match self.role {
            Role::CollegeAdmin { institution_id } => Ok(institution_id),
            Role::Student | Role::Company => Err(ApiError::forbidden(
                "mentor management requires a college admin session",
            )),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Error)]
pub enum SessionTokenError {
    #[error("failed to sign session token: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),
    #[error("invalid session token: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
    #[error("session token subject '{0}' is malformed")]
    Subject(String),
}

impl From<SessionTokenError> for ApiError {
    fn from(value: SessionTokenError) -> Self {
        let code = match value {
            SessionTokenError::Sign(_) => ErrorCode::Internal,
            SessionTokenError::Invalid(_) | SessionTokenError::Subject(_) => {
                ErrorCode::Unauthorized
            }
        };
        ApiError::new(code, value.to_string())
    }
}

pub fn mint_session_token(
    cfg: &SessionConfig,
    session: &Session,
) -> Result<String, SessionTokenError> {
    let now = Utc::now();
    let exp = now + Duration::seconds(cfg.ttl_seconds);
    let claims = Claims {
        sub: format!("profile:{}", session.profile_id.0),
        email: session.email.clone(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )
    .map_err(SessionTokenError::Sign)
}

/// Checks signature and expiry and returns the profile the token was issued to.
pub fn verify_session_token(
    cfg: &SessionConfig,
    token: &str,
) -> Result<ProfileId, SessionTokenError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(SessionTokenError::Invalid)?;

    let subject = data.claims.sub;
    match subject
        .strip_prefix("profile:")
        .and_then(|raw| raw.parse::<i64>().ok())
    {
        Some(id) => Ok(ProfileId(id)),
        None => Err(SessionTokenError::Subject(subject)),
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
