use actix_web::{dev::Payload, FromRequest, HttpRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::env;
use std::future::{ready, Ready};
use tracing::{debug, error};

use crate::error::ApiError;
pub use crate::models::Role;
use crate::models::{Actor, Id};

const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: Id,
    pub username: String,
    pub exp: usize,
    pub roles: Vec<Role>,
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("JWT_SECRET not set")]
    MissingSecret,
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

fn secret() -> Result<String, AuthError> {
    env::var("JWT_SECRET").map_err(|_| AuthError::MissingSecret)
}

/// Validate a JWT and return its claims.
pub fn decode_jwt(token: &str) -> Result<Claims, AuthError> {
    let secret = secret()?;
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)?;
    Ok(data.claims)
}

/// Extractor yielding validated `Claims`.
pub struct Auth(pub Claims);

impl Auth {
    /// The requester as the store sees it, acting with its highest role.
    pub fn actor(&self) -> Actor {
        let role = self.0.roles.iter().copied().max().unwrap_or(Role::User);
        Actor::new(self.0.sub, role)
    }

    pub fn user_id(&self) -> Id {
        self.0.sub
    }
}

impl FromRequest for Auth {
    type Error = ApiError;
    type Future = Ready<Result<Self, ApiError>>;

    fn from_request(req: &HttpRequest, pl: &mut Payload) -> Self::Future {
        let Ok(bearer) = BearerAuth::from_request(req, pl).into_inner() else {
            return ready(Err(ApiError::Unauthorized));
        };
        match decode_jwt(bearer.token()) {
            Ok(claims) => ready(Ok(Auth(claims))),
            Err(AuthError::MissingSecret) => {
                error!("JWT_SECRET not set, rejecting authenticated request");
                ready(Err(ApiError::Internal))
            }
            Err(e) => {
                debug!(error = %e, "rejected bearer token");
                ready(Err(ApiError::Unauthorized))
            }
        }
    }
}

/// Reject the request with 403 unless the caller holds one of the roles.
#[macro_export]
macro_rules! require_role {
    ($auth:expr, $role:pat) => {
        if !$auth.0.roles.iter().any(|r| matches!(r, $role)) {
            return Err($crate::error::ApiError::Forbidden.into());
        }
    };
}

/// Sign a token for `user_id`. Issuance belongs to the account service; this
/// exists for tooling and tests.
pub fn create_jwt(user_id: Id, username: &str, roles: Vec<Role>) -> Result<String, AuthError> {
    let secret = secret()?;
    let exp = (chrono::Utc::now() + chrono::Duration::hours(TOKEN_TTL_HOURS)).timestamp() as usize;
    let claims = Claims { sub: user_id, username: username.to_string(), exp, roles };
    Ok(encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))?)
}
