//! Per-operation identity guard for backend services.

use std::sync::Arc;

use tonic::Request;
use tracing::debug;

use crate::auth::claims::{Claims, Role};
use crate::auth::interceptor::ForwardedIdentity;
use crate::auth::issuer::TokenIssuer;
use crate::error::{GatewayError, GatewayResult};

/// Identity an operation requires before its business logic runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Reachable without an assertion.
    Public,
    /// Requires a valid assertion.
    Authenticated,
    /// Requires a valid assertion carrying this role.
    Role(Role),
}

/// Who is calling, as established by the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Anonymous,
    User(Claims),
}

impl Caller {
    /// Authoritative claims, or `PermissionDenied` for anonymous callers.
    pub fn claims(&self) -> GatewayResult<&Claims> {
        match self {
            Self::User(claims) => Ok(claims),
            Self::Anonymous => Err(not_authenticated()),
        }
    }

    pub fn user_id(&self) -> Option<i64> {
        match self {
            Self::User(claims) => Some(claims.user_id),
            Self::Anonymous => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::User(claims) if claims.is_admin())
    }
}

fn not_authenticated() -> GatewayError {
    GatewayError::PermissionDenied("Error not authenticated".to_string())
}

/// Admits or rejects a call before it reaches business logic.
///
/// The forwarded assertion is the only source of identity: it is always
/// re-validated locally with the shared secret, never taken on trust.
#[derive(Debug, Clone)]
pub struct DownstreamAuthGuard {
    issuer: Arc<TokenIssuer>,
}

impl DownstreamAuthGuard {
    pub fn new(issuer: Arc<TokenIssuer>) -> Self {
        Self { issuer }
    }

    /// Check an inbound RPC request against `access`.
    ///
    /// A request that never went through the identity interceptor is treated
    /// as carrying no identity.
    pub fn admit<T>(&self, access: Access, request: &Request<T>) -> GatewayResult<Caller> {
        self.admit_identity(access, request.extensions().get::<ForwardedIdentity>())
    }

    pub fn admit_identity(
        &self,
        access: Access,
        forwarded: Option<&ForwardedIdentity>,
    ) -> GatewayResult<Caller> {
        let assertion = match forwarded {
            Some(ForwardedIdentity::Present(assertion)) => Some(assertion),
            Some(ForwardedIdentity::Missing) | None => None,
        };

        match (access, assertion) {
            // Public operations still learn who is calling when they can.
            (Access::Public, None) => Ok(Caller::Anonymous),
            (Access::Public, Some(assertion)) => Ok(self
                .issuer
                .validate(assertion.as_str())
                .map(Caller::User)
                .unwrap_or(Caller::Anonymous)),
            (_, None) => {
                debug!(?access, "Rejected call without forwarded identity");
                Err(not_authenticated())
            }
            (Access::Authenticated, Some(assertion)) => {
                let claims = self.issuer.validate(assertion.as_str())?;
                Ok(Caller::User(claims))
            }
            (Access::Role(required), Some(assertion)) => {
                let claims = self.issuer.validate(assertion.as_str())?;
                if claims.role != required {
                    debug!(
                        user_id = claims.user_id,
                        role = %claims.role,
                        required = %required,
                        "Rejected call with insufficient role"
                    );
                    return Err(GatewayError::PermissionDenied(format!(
                        "operation requires {} role",
                        required
                    )));
                }
                Ok(Caller::User(claims))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TokenFault;
    use crate::types::SignedAssertion;

    fn guard() -> (DownstreamAuthGuard, Arc<TokenIssuer>) {
        let issuer = Arc::new(TokenIssuer::new(b"guard-secret", TokenIssuer::DEFAULT_LIFETIME).unwrap());
        (DownstreamAuthGuard::new(issuer.clone()), issuer)
    }

    fn present(assertion: SignedAssertion) -> ForwardedIdentity {
        ForwardedIdentity::Present(assertion)
    }

    #[test]
    fn test_missing_identity_is_permission_denied() {
        let (guard, _) = guard();
        let err = guard
            .admit_identity(Access::Authenticated, Some(&ForwardedIdentity::Missing))
            .unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));

        let err = guard.admit_identity(Access::Authenticated, None).unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));
    }

    #[test]
    fn test_public_access_admits_anonymous() {
        let (guard, _) = guard();
        let caller = guard
            .admit_identity(Access::Public, Some(&ForwardedIdentity::Missing))
            .unwrap();
        assert_eq!(caller, Caller::Anonymous);
    }

    #[test]
    fn test_public_access_ignores_bad_assertion() {
        let (guard, _) = guard();
        let caller = guard
            .admit_identity(Access::Public, Some(&present(SignedAssertion::new("junk"))))
            .unwrap();
        assert_eq!(caller, Caller::Anonymous);
    }

    #[test]
    fn test_authenticated_access_returns_claims() {
        let (guard, issuer) = guard();
        let assertion = issuer.generate(11, Role::User).unwrap();
        let caller = guard
            .admit_identity(Access::Authenticated, Some(&present(assertion)))
            .unwrap();
        assert_eq!(caller.user_id(), Some(11));
        assert!(!caller.is_admin());
    }

    #[test]
    fn test_expired_assertion_is_revalidated_and_rejected() {
        let (guard, issuer) = guard();
        let old = chrono::Utc::now().timestamp() - 30 * 24 * 60 * 60;
        let assertion = issuer.generate_at(11, Role::Admin, old).unwrap();
        let err = guard
            .admit_identity(Access::Authenticated, Some(&present(assertion)))
            .unwrap_err();
        assert_eq!(err, GatewayError::InvalidToken(TokenFault::Expired));
    }

    #[test]
    fn test_role_mismatch_is_permission_denied() {
        let (guard, issuer) = guard();
        let assertion = issuer.generate(3, Role::User).unwrap();
        let err = guard
            .admit_identity(Access::Role(Role::Admin), Some(&present(assertion)))
            .unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied(_)));
    }

    #[test]
    fn test_role_match_is_admitted() {
        let (guard, issuer) = guard();
        let assertion = issuer.generate(3, Role::Admin).unwrap();
        let caller = guard
            .admit_identity(Access::Role(Role::Admin), Some(&present(assertion)))
            .unwrap();
        assert!(caller.is_admin());
    }

    #[test]
    fn test_admit_reads_request_extension() {
        let (guard, issuer) = guard();
        let mut request = Request::new(());
        request
            .extensions_mut()
            .insert(present(issuer.generate(5, Role::User).unwrap()));
        let caller = guard.admit(Access::Authenticated, &request).unwrap();
        assert_eq!(caller.user_id(), Some(5));

        let bare = Request::new(());
        assert!(guard.admit(Access::Authenticated, &bare).is_err());
    }

    #[test]
    fn test_anonymous_caller_has_no_claims() {
        assert!(matches!(
            Caller::Anonymous.claims(),
            Err(GatewayError::PermissionDenied(_))
        ));
    }
}
