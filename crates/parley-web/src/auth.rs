//! Bearer-token authentication. The verified claims become the request's
//! [`Principal`]; nothing in the request body can override them.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parley_core::config::{resolve_secret, AuthConfig};
use parley_core::model::{Principal, Role};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::AppState;

const DEFAULT_SECRET_ENV: &str = "PARLEY_JWT_SECRET";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub client_id: String,
    pub role: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 verifier for access tokens issued by the host application.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str, issuer: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["sub", "exp", "iat", "iss"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn from_config(config: &AuthConfig) -> parley_core::Result<Self> {
        let secret = resolve_secret(
            config.jwt_secret.as_deref(),
            config.env_var.as_deref(),
            DEFAULT_SECRET_ENV,
            "JWT secret",
        )?;
        Ok(Self::new(&secret, &config.jwt_issuer))
    }

    pub fn verify(&self, token: &str) -> Result<Principal, ApiError> {
        let claims = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => ApiError::unauthorized("token expired"),
                _ => {
                    tracing::debug!("rejected bearer token: {e}");
                    ApiError::unauthorized("invalid token")
                }
            })?;

        let role: Role = claims
            .role
            .parse()
            .map_err(|_| ApiError::unauthorized("token carries an unknown role"))?;
        Ok(Principal::new(claims.sub, claims.client_id, role))
    }
}

/// The authenticated caller.
pub struct Authenticated(pub Principal);

impl FromRequestParts<Arc<AppState>> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        let token = header
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
        state.jwt.verify(token).map(Authenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sign, token, SECRET};
    use axum::http::StatusCode;

    fn verifier() -> JwtVerifier {
        JwtVerifier::new(SECRET, "parley")
    }

    #[test]
    fn test_valid_token_yields_principal() {
        let principal = verifier()
            .verify(&token("alice", "acme", Role::Developer))
            .unwrap();
        assert_eq!(principal.user_id, "alice");
        assert_eq!(principal.client_ids, vec!["acme".to_string()]);
        assert_eq!(principal.role, Role::Developer);
    }

    #[test]
    fn test_expired_token_rejected() {
        let now = chrono::Utc::now().timestamp();
        let expired = sign(&Claims {
            sub: "alice".into(),
            client_id: "acme".into(),
            role: "developer".into(),
            iss: "parley".into(),
            iat: now - 7200,
            exp: now - 3600,
        });
        let err = verifier().verify(&expired).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.message, "token expired");
    }

    #[test]
    fn test_wrong_issuer_rejected() {
        let now = chrono::Utc::now().timestamp();
        let foreign = sign(&Claims {
            sub: "alice".into(),
            client_id: "acme".into(),
            role: "developer".into(),
            iss: "someone-else".into(),
            iat: now,
            exp: now + 600,
        });
        assert!(verifier().verify(&foreign).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let other = JwtVerifier::new("another-secret", "parley");
        assert!(other.verify(&token("alice", "acme", Role::Admin)).is_err());
    }

    #[test]
    fn test_unknown_role_rejected() {
        let now = chrono::Utc::now().timestamp();
        let odd = sign(&Claims {
            sub: "alice".into(),
            client_id: "acme".into(),
            role: "superuser".into(),
            iss: "parley".into(),
            iat: now,
            exp: now + 600,
        });
        let err = verifier().verify(&odd).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_from_config_requires_secret() {
        let config = AuthConfig {
            jwt_secret: None,
            env_var: Some(format!("PARLEY_TEST_UNSET_{}", uuid::Uuid::now_v7().simple())),
            jwt_issuer: "parley".into(),
        };
        assert!(JwtVerifier::from_config(&config).is_err());

        let config = AuthConfig {
            jwt_secret: Some(SECRET.into()),
            ..config
        };
        assert!(JwtVerifier::from_config(&config).is_ok());
    }
}
