//! Session identity resolution.
//!
//! Bearer tokens are verified by an [`AuthVerifier`]; the gateway never
//! issues them. Sessions without a token become guests whose identifiers
//! always carry [`GUEST_PREFIX`], so a guest can never address an
//! authenticated user's traffic.

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use shared_types::{is_guest_id, GUEST_PREFIX};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token subject is empty")]
    EmptySubject,

    #[error("Token subject uses the reserved guest prefix")]
    ReservedSubject,
}

/// Verifies a bearer token and returns the subject it authenticates.
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<String, AuthError>;
}

#[derive(Debug, Clone, Deserialize)]
struct Claims {
    sub: String,
}

/// HS256 JWT verifier. Expiry is enforced.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.trim().is_empty() {
            anyhow::bail!("JWT secret must not be empty");
        }
        Ok(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        })
    }
}

impl AuthVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        let sub = data.claims.sub.trim().to_string();
        if sub.is_empty() {
            return Err(AuthError::EmptySubject);
        }
        if is_guest_id(&sub) {
            return Err(AuthError::ReservedSubject);
        }
        Ok(sub)
    }
}

/// Resolved identity of a session or HTTP caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    User(String),
    Guest(String),
}

impl Identity {
    pub fn user_id(&self) -> &str {
        match self {
            Identity::User(id) | Identity::Guest(id) => id,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Identity::Guest(_))
    }
}

/// Guest identity from a client-supplied id, or a fresh one.
pub fn guest_identity(requested: Option<&str>) -> Identity {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) if is_guest_id(id) => Identity::Guest(id.to_string()),
        Some(id) => Identity::Guest(format!("{GUEST_PREFIX}{id}")),
        None => Identity::Guest(format!("{GUEST_PREFIX}{}", Uuid::new_v4().simple())),
    }
}

/// Token first, then explicit guest id, then a generated guest id.
pub fn resolve_identity(
    verifier: &dyn AuthVerifier,
    token: Option<&str>,
    guest_id: Option<&str>,
) -> Result<Identity, AuthError> {
    match token.map(str::trim).filter(|t| !t.is_empty()) {
        Some(token) => verifier.verify(token).map(Identity::User),
        None => Ok(guest_identity(guest_id)),
    }
}

/// Extract a bearer token from the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const TEST_SECRET: &str = "test-jwt-secret";

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        exp: usize,
    }

    fn token_for(sub: &str, exp_offset_secs: i64) -> String {
        let exp = (chrono::Utc::now().timestamp() + exp_offset_secs) as usize;
        encode(
            &Header::default(),
            &TestClaims { sub, exp },
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_resolves_subject() {
        let verifier = JwtVerifier::new(TEST_SECRET).unwrap();
        let id = resolve_identity(&verifier, Some(&token_for("alice", 3600)), None).unwrap();
        assert_eq!(id, Identity::User("alice".into()));
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = JwtVerifier::new(TEST_SECRET).unwrap();
        let err = verifier.verify(&token_for("alice", -3600)).unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::new("another-secret").unwrap();
        assert!(verifier.verify(&token_for("alice", 3600)).is_err());
    }

    #[test]
    fn test_guest_subject_rejected() {
        let verifier = JwtVerifier::new(TEST_SECRET).unwrap();
        assert_eq!(
            verifier.verify(&token_for("guest_mallory", 3600)),
            Err(AuthError::ReservedSubject)
        );
    }

    #[test]
    fn test_token_wins_over_guest_id() {
        let verifier = JwtVerifier::new(TEST_SECRET).unwrap();
        let id =
            resolve_identity(&verifier, Some(&token_for("alice", 3600)), Some("guest_x")).unwrap();
        assert_eq!(id.user_id(), "alice");
        assert!(!id.is_guest());
    }

    #[test]
    fn test_guest_ids_are_prefixed() {
        assert_eq!(
            guest_identity(Some("guest_abc")),
            Identity::Guest("guest_abc".into())
        );
        // A guest cannot claim an authenticated identity.
        assert_eq!(guest_identity(Some("alice")), Identity::Guest("guest_alice".into()));

        let fresh = guest_identity(None);
        assert!(fresh.is_guest());
        assert!(fresh.user_id().starts_with(GUEST_PREFIX));
        assert_ne!(fresh, guest_identity(Some("  ")));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(JwtVerifier::new("  ").is_err());
    }

    #[test]
    fn test_bearer_token_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));
        headers.insert(header::AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
