//! Issuing and validating signed identity assertions.

use std::fmt;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::debug;

use crate::auth::claims::{Claims, Role};
use crate::config::DEFAULT_ASSERTION_LIFETIME_SECS;
use crate::error::{GatewayError, GatewayResult, TokenFault};
use crate::types::SignedAssertion;

/// Creates and validates HS512-signed assertions over a shared secret.
///
/// Holds no mutable state; share it behind an `Arc`.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    lifetime: Duration,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("algorithm", &Algorithm::HS512)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(DEFAULT_ASSERTION_LIFETIME_SECS);

    /// Build an issuer. An empty secret is a configuration error.
    pub fn new(secret: &[u8], lifetime: Duration) -> GatewayResult<Self> {
        if secret.is_empty() {
            return Err(GatewayError::Signing(
                "signing secret is not configured".to_string(),
            ));
        }

        let mut validation = Validation::new(Algorithm::HS512);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "iat"]);

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            lifetime,
        })
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Sign a fresh assertion for `user_id` that expires one lifetime from now.
    pub fn generate(&self, user_id: i64, role: Role) -> GatewayResult<SignedAssertion> {
        self.generate_at(user_id, role, chrono::Utc::now().timestamp())
    }

    /// Sign an assertion as if it had been issued at `issued_at`.
    pub fn generate_at(
        &self,
        user_id: i64,
        role: Role,
        issued_at: i64,
    ) -> GatewayResult<SignedAssertion> {
        let claims = Claims {
            user_id,
            role,
            iat: issued_at,
            exp: issued_at + self.lifetime.as_secs() as i64,
        };

        let token = encode(&Header::new(Algorithm::HS512), &claims, &self.encoding)
            .map_err(|e| GatewayError::Signing(e.to_string()))?;

        debug!(user_id, role = %role, exp = claims.exp, "Issued signed assertion");
        Ok(SignedAssertion::new(token))
    }

    /// Verify signature and expiry, returning the embedded claims.
    pub fn validate(&self, assertion: &str) -> GatewayResult<Claims> {
        if assertion.is_empty() {
            return Err(GatewayError::EmptyToken);
        }

        let data = decode::<Claims>(assertion, &self.decoding, &self.validation).map_err(|e| {
            let fault = match e.kind() {
                ErrorKind::ExpiredSignature => TokenFault::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    TokenFault::BadSignature
                }
                _ => TokenFault::Malformed,
            };
            debug!(error = %e, "Rejected signed assertion");
            GatewayError::InvalidToken(fault)
        })?;

        Ok(data.claims)
    }
}
