//! src/tunnel/auth.rs
//!
//! Token validation for upstream listener registration: HMAC/RSA/ECDSA JWTs
//! carrying an endpoint allow-list and expiry, checked with `jsonwebtoken`.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Claims {
    /// Endpoint IDs this token is allowed to register a listener for.
    #[serde(default)]
    endpoints: Vec<String>,
    /// Standard JWT expiry claim, enforced by `jsonwebtoken` itself.
    #[allow(dead_code)]
    exp: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token is malformed or its signature is invalid")]
    InvalidToken,
    #[error("token has expired")]
    Expired,
    #[error("token is not authorized for endpoint {0}")]
    EndpointNotAllowed(String),
    #[error("invalid listener auth configuration: {0}")]
    InvalidConfig(String),
}

impl AuthError {
    /// Expired and malformed tokens are the caller's fault and are not
    /// retryable; a momentarily misconfigured server-side key, which this
    /// crate doesn't distinguish today, would be the retryable case.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// A validator configured once per tunnel listener. `Disabled` means token
/// validation is disabled and every listener registration is accepted.
pub enum Validator {
    Disabled,
    Hmac { secret: Vec<u8> },
    Rsa { key: DecodingKey, algorithm: Algorithm },
    Ecdsa { key: DecodingKey, algorithm: Algorithm },
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Validator::Disabled => f.write_str("Disabled"),
            Validator::Hmac { .. } => f.write_str("Hmac"),
            Validator::Rsa { algorithm, .. } => f.debug_struct("Rsa").field("algorithm", algorithm).finish(),
            Validator::Ecdsa { algorithm, .. } => f.debug_struct("Ecdsa").field("algorithm", algorithm).finish(),
        }
    }
}

impl Validator {
    /// Builds a validator from the configured algorithm name (defaulting
    /// to `HS256`) and key material. `key_material` is the shared secret
    /// for HMAC algorithms, or a PEM-encoded public key for RSA/ECDSA.
    pub fn from_config(algorithm: Option<&str>, key_material: Option<&str>) -> Result<Self, AuthError> {
        let Some(key_material) = key_material else {
            return Ok(Validator::Disabled);
        };
        match algorithm.unwrap_or("HS256") {
            "HS256" => Ok(Validator::Hmac { secret: key_material.as_bytes().to_vec() }),
            name @ ("RS256" | "RS384" | "RS512") => {
                let key = DecodingKey::from_rsa_pem(key_material.as_bytes())
                    .map_err(|e| AuthError::InvalidConfig(e.to_string()))?;
                Ok(Validator::Rsa { key, algorithm: parse_algorithm(name)? })
            }
            name @ ("ES256" | "ES384") => {
                let key = DecodingKey::from_ec_pem(key_material.as_bytes())
                    .map_err(|e| AuthError::InvalidConfig(e.to_string()))?;
                Ok(Validator::Ecdsa { key, algorithm: parse_algorithm(name)? })
            }
            other => Err(AuthError::InvalidConfig(format!("unsupported JWT algorithm {other}"))),
        }
    }

    /// Validates `token` for `endpoint_id`. No-op when validation is
    /// disabled.
    pub fn validate(&self, token: Option<&str>, endpoint_id: &str) -> Result<(), AuthError> {
        let (key, algorithm, token) = match (self, token) {
            (Validator::Disabled, _) => return Ok(()),
            (Validator::Hmac { secret }, Some(token)) => (DecodingKey::from_secret(secret), Algorithm::HS256, token),
            (Validator::Rsa { key, algorithm }, Some(token)) => (key.clone(), *algorithm, token),
            (Validator::Ecdsa { key, algorithm }, Some(token)) => (key.clone(), *algorithm, token),
            (Validator::Hmac { .. } | Validator::Rsa { .. } | Validator::Ecdsa { .. }, None) => {
                return Err(AuthError::InvalidToken)
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;

        let data = decode::<Claims>(token, &key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken,
            }
        })?;

        if data.claims.endpoints.is_empty() || data.claims.endpoints.iter().any(|e| e == endpoint_id) {
            Ok(())
        } else {
            Err(AuthError::EndpointNotAllowed(endpoint_id.to_string()))
        }
    }
}

fn parse_algorithm(name: &str) -> Result<Algorithm, AuthError> {
    match name {
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "ES256" => Ok(Algorithm::ES256),
        "ES384" => Ok(Algorithm::ES384),
        other => Err(AuthError::InvalidConfig(format!("unsupported JWT algorithm {other}"))),
    }
}
