use haul_core::models::{Identity, UserType};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::id_from_value;

const UNKNOWN_USER: &str = "Unknown User";
const KNOWN_ROLES: &[&str] = &["admin", "dispatcher", "driver"];

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("authentication token is missing")]
    MissingToken,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
    #[error("token is malformed: {0}")]
    Malformed(String),
}

/// Validates HS256 bearer tokens issued by the main backend.
pub struct Authenticator {
    key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // `exp` is checked when present; older tokens carry none.
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }

    pub fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;

        let data = decode::<Value>(token, &self.key, &self.validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            _ => AuthError::Malformed(e.to_string()),
        })?;

        let identity = identity_from_claims(&data.claims);
        debug!(
            user_id = ?identity.user_id,
            user_type = %identity.user_type,
            "token authenticated"
        );
        Ok(identity)
    }
}

/// Map token claims to an identity, falling back to the least privileged
/// reading of anything missing.
pub fn identity_from_claims(claims: &Value) -> Identity {
    let user_id = ["id", "userId", "sub"]
        .iter()
        .find_map(|field| claims.get(*field).and_then(id_from_value));
    if user_id.is_none() {
        warn!("token carries no usable user id");
    }

    let username = ["username", "name"]
        .iter()
        .find_map(|field| claims.get(*field).and_then(Value::as_str))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(UNKNOWN_USER)
        .to_string();

    let role = claims
        .get("role")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase)
        .filter(|role| KNOWN_ROLES.contains(&role.as_str()))
        .unwrap_or_else(|| "driver".to_string());

    Identity {
        user_id,
        username,
        user_type: UserType::from_role(&role),
        role,
    }
}

/// Token from the `token` query parameter, else an `Authorization: Bearer` header.
pub fn extract_token<'a>(query_token: Option<&'a str>, authorization: Option<&'a str>) -> Option<&'a str> {
    query_token.filter(|t| !t.is_empty()).or_else(|| {
        authorization
            .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    pub fn sign(claims: &Value, secret: &str) -> String {
        encode(&Header::default(), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn authenticator() -> Authenticator {
        Authenticator::new(&SecretString::from("test-secret"))
    }

    fn in_an_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn valid_dispatcher_token() {
        let token = sign(
            &json!({"id": 9, "username": "Alice", "role": "dispatcher", "exp": in_an_hour()}),
            "test-secret",
        );
        let identity = authenticator().authenticate(Some(&token)).unwrap();
        assert_eq!(identity.user_id, Some(9));
        assert_eq!(identity.username, "Alice");
        assert_eq!(identity.user_type, UserType::Dispatcher);
    }

    #[test]
    fn missing_token() {
        assert_eq!(authenticator().authenticate(None), Err(AuthError::MissingToken));
        assert_eq!(authenticator().authenticate(Some("  ")), Err(AuthError::MissingToken));
    }

    #[test]
    fn wrong_secret_is_invalid_signature() {
        let token = sign(&json!({"id": 9, "exp": in_an_hour()}), "other-secret");
        assert_eq!(authenticator().authenticate(Some(&token)), Err(AuthError::InvalidSignature));
    }

    #[test]
    fn expired_token() {
        let past = chrono::Utc::now().timestamp() - 7200;
        let token = sign(&json!({"id": 9, "exp": past}), "test-secret");
        assert_eq!(authenticator().authenticate(Some(&token)), Err(AuthError::Expired));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = authenticator().authenticate(Some("not.a.jwt")).unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));
    }

    #[test]
    fn claims_fallbacks() {
        let identity = identity_from_claims(&json!({"role": "superuser"}));
        assert_eq!(identity.user_id, None);
        assert_eq!(identity.username, UNKNOWN_USER);
        assert_eq!(identity.role, "driver");
        assert_eq!(identity.user_type, UserType::Driver);

        let identity = identity_from_claims(&json!({"userId": "42", "name": "Dana", "role": "Admin"}));
        assert_eq!(identity.user_id, Some(42));
        assert_eq!(identity.username, "Dana");
        assert_eq!(identity.user_type, UserType::Dispatcher);

        let identity = identity_from_claims(&json!({"sub": "17"}));
        assert_eq!(identity.user_id, Some(17));
    }

    #[test]
    fn token_sources() {
        assert_eq!(extract_token(Some("abc"), Some("Bearer xyz")), Some("abc"));
        assert_eq!(extract_token(None, Some("Bearer xyz")), Some("xyz"));
        assert_eq!(extract_token(Some(""), Some("Bearer xyz")), Some("xyz"));
        assert_eq!(extract_token(None, Some("Basic xyz")), None);
        assert_eq!(extract_token(None, None), None);
    }
}
