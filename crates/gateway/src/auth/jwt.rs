//! Bearer token verification.
//!
//! Credential issuance lives outside the gateway; this module only verifies
//! tokens and exposes the verified claims. The `TokenVerifier` trait is the
//! seam for swapping in an external verifier.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Verified claims extracted from a bearer credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedClaims {
    /// Subject (user ID)
    pub sub: String,
    /// User roles
    #[serde(default)]
    pub roles: Vec<String>,
    /// Workspace/tenant identifier
    #[serde(default)]
    pub tenant: Option<String>,
    /// Email
    #[serde(default)]
    pub email: Option<String>,
    /// Issued at
    #[serde(default)]
    pub iat: Option<i64>,
    /// Expiration
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Invalid token: {0}")]
    Invalid(String),
    #[error("Token has expired")]
    Expired,
    #[error("Token too old")]
    TooOld,
}

/// Verifies a bearer credential and returns the claims it asserts.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<VerifiedClaims, TokenError>;
}

/// HS256 JWT verifier with issuer/audience pinning.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    /// Maximum accepted age since `iat`, in seconds. 0 disables the check.
    max_token_age_secs: i64,
}

impl JwtVerifier {
    pub fn new(secret: &str, issuer: &str, audience: &str, max_token_age_secs: i64) -> Self {
        // Explicit algorithm list prevents algorithm confusion attacks.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            max_token_age_secs,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<VerifiedClaims, TokenError> {
        let data = decode::<VerifiedClaims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            },
        )?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(TokenError::Invalid("missing 'sub' claim".to_string()));
        }

        // Freshness window on top of exp: reject long-lived tokens minted
        // far in the past.
        if self.max_token_age_secs > 0 {
            let iat = claims
                .iat
                .ok_or_else(|| TokenError::Invalid("missing 'iat' claim".to_string()))?;
            let now = OffsetDateTime::now_utc().unix_timestamp();
            if iat > now + 60 {
                return Err(TokenError::Invalid("'iat' claim is in the future".to_string()));
            }
            if now - iat > self.max_token_age_secs {
                return Err(TokenError::TooOld);
            }
        }

        Ok(claims)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn token_from_header(authorization: &str) -> Result<&str, TokenError> {
    let mut parts = authorization.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some(scheme), Some(token)) if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() => {
            Ok(token)
        }
        _ => Err(TokenError::Invalid(
            "Invalid Authorization header format. Expected: 'Bearer <token>'".to_string(),
        )),
    }
}
