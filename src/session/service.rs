//! Sign-in, logout and handle translation.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::{CallContext, Role, TokenIssuer};
use crate::error::{GatewayError, GatewayResult};
use crate::session::store::SessionStore;
use crate::types::{OpaqueHandle, SignedAssertion};

/// Identity established by a successful login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub role: Role,
}

/// Verifies a login/password pair.
///
/// Fails with [`GatewayError::Authentication`] when the credentials are wrong.
pub trait UserAuthenticator: Send + Sync + 'static {
    fn authenticate(
        &self,
        ctx: &CallContext,
        login: &str,
        password: &str,
    ) -> impl Future<Output = GatewayResult<AuthenticatedUser>> + Send;
}

/// Body of a successful sign-in. Only the opaque handle leaves the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInResponse {
    pub token: OpaqueHandle,
    pub token_type: String,
    pub created_at: DateTime<Utc>,
}

/// Orchestrates the session lifecycle.
pub struct GatewaySessionService<A> {
    authenticator: A,
    issuer: Arc<TokenIssuer>,
    store: SessionStore,
}

impl<A: UserAuthenticator> GatewaySessionService<A> {
    pub fn new(authenticator: A, issuer: Arc<TokenIssuer>, store: SessionStore) -> Self {
        Self {
            authenticator,
            issuer,
            store,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Authenticate, issue an assertion, and persist it behind a new handle.
    ///
    /// Issuance and persistence are separate steps; a failure between them
    /// leaves nothing behind because the caller never sees a handle.
    pub async fn sign_in(
        &self,
        ctx: &CallContext,
        login: &str,
        password: &str,
    ) -> GatewayResult<SignInResponse> {
        let user = ctx
            .scoped(self.authenticator.authenticate(ctx, login, password))
            .await?;
        let assertion = self.issuer.generate(user.user_id, user.role)?;
        let record = ctx
            .scoped(self.store.save_token(user.user_id, &assertion))
            .await?;

        info!(
            request_id = %ctx.request_id(),
            user_id = user.user_id,
            role = %user.role,
            "User signed in"
        );

        Ok(SignInResponse {
            token: record.opaque,
            token_type: "opaque".to_string(),
            created_at: record.created_at,
        })
    }

    /// Revoke `opaque`. Unknown handles propagate as `NotFound`.
    pub async fn logout(&self, ctx: &CallContext, opaque: &OpaqueHandle) -> GatewayResult<()> {
        ctx.scoped(self.store.remove_token(opaque)).await
    }

    /// Exchange `opaque` for its stored assertion.
    ///
    /// Expiry is not checked here; each backend re-validates the assertion
    /// before acting on it.
    pub async fn translate(
        &self,
        ctx: &CallContext,
        opaque: &OpaqueHandle,
    ) -> GatewayResult<SignedAssertion> {
        if opaque.is_empty() {
            return Err(GatewayError::NotFound("session".to_string()));
        }

        match ctx.scoped(self.store.find_token(opaque)).await {
            Ok(record) => Ok(record.assertion),
            Err(e) => {
                if !matches!(e, GatewayError::NotFound(_)) {
                    warn!(request_id = %ctx.request_id(), error = %e, "Handle translation failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::{DatabaseConfig, create_connection, ensure_schema};
    use std::collections::HashMap;
    use std::time::Duration;

    /// Authenticator backed by a fixed credential table.
    pub(crate) struct StaticAuthenticator {
        users: HashMap<String, (String, AuthenticatedUser)>,
    }

    impl StaticAuthenticator {
        pub(crate) fn new() -> Self {
            let mut users = HashMap::new();
            users.insert(
                "alice".to_string(),
                (
                    "wonderland".to_string(),
                    AuthenticatedUser {
                        user_id: 1,
                        role: Role::User,
                    },
                ),
            );
            users.insert(
                "root".to_string(),
                (
                    "toor".to_string(),
                    AuthenticatedUser {
                        user_id: 2,
                        role: Role::Admin,
                    },
                ),
            );
            Self { users }
        }
    }

    impl UserAuthenticator for StaticAuthenticator {
        fn authenticate(
            &self,
            _ctx: &CallContext,
            login: &str,
            password: &str,
        ) -> impl Future<Output = GatewayResult<AuthenticatedUser>> + Send {
            let result = match self.users.get(login) {
                Some((expected, user)) if expected == password => Ok(*user),
                _ => Err(GatewayError::Authentication),
            };
            async move { result }
        }
    }

    async fn setup_service() -> (GatewaySessionService<StaticAuthenticator>, Arc<TokenIssuer>) {
        let db = create_connection(DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        ensure_schema(&db).await.unwrap();

        let issuer = Arc::new(TokenIssuer::new(b"session-secret", TokenIssuer::DEFAULT_LIFETIME).unwrap());
        let service = GatewaySessionService::new(
            StaticAuthenticator::new(),
            issuer.clone(),
            SessionStore::new(db),
        );
        (service, issuer)
    }

    #[tokio::test]
    async fn test_sign_in_returns_only_opaque_handle() {
        let (service, issuer) = setup_service().await;
        let ctx = CallContext::new();

        let res = service.sign_in(&ctx, "alice", "wonderland").await.unwrap();
        assert_eq!(res.token_type, "opaque");
        assert_eq!(res.token.as_str().len(), 43);
        // The handle is not itself a valid assertion.
        assert!(issuer.validate(res.token.as_str()).is_err());

        let assertion = service.translate(&ctx, &res.token).await.unwrap();
        let claims = issuer.validate(assertion.as_str()).unwrap();
        assert_eq!(claims.user_id, 1);
        assert_eq!(claims.role, Role::User);
    }

    #[tokio::test]
    async fn test_bad_credentials_are_authentication_error() {
        let (service, _) = setup_service().await;
        let err = service
            .sign_in(&CallContext::new(), "alice", "wrong")
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::Authentication);
        assert_eq!(service.store().count_for_user(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_logout_then_translate_is_not_found() {
        let (service, _) = setup_service().await;
        let ctx = CallContext::new();
        let res = service.sign_in(&ctx, "root", "toor").await.unwrap();

        service.logout(&ctx, &res.token).await.unwrap();
        assert!(matches!(
            service.translate(&ctx, &res.token).await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            service.logout(&ctx, &res.token).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_sign_ins_are_independent() {
        let (service, _) = setup_service().await;
        let service = Arc::new(service);

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .sign_in(&CallContext::new(), "alice", "wonderland")
                        .await
                        .unwrap()
                        .token
                })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        let distinct: std::collections::HashSet<_> = handles.iter().cloned().collect();
        assert_eq!(distinct.len(), 5);

        let ctx = CallContext::new();
        service.logout(&ctx, &handles[0]).await.unwrap();
        assert!(service.translate(&ctx, &handles[0]).await.is_err());
        for handle in &handles[1..] {
            assert!(service.translate(&ctx, handle).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_translate_does_not_check_expiry() {
        let (service, issuer) = setup_service().await;
        let old = chrono::Utc::now().timestamp() - 20 * 24 * 60 * 60;
        let expired = issuer.generate_at(1, Role::User, old).unwrap();
        let record = service.store().save_token(1, &expired).await.unwrap();

        let translated = service
            .translate(&CallContext::new(), &record.opaque)
            .await
            .unwrap();
        assert_eq!(translated, expired);
    }

    #[tokio::test]
    async fn test_cancelled_context_aborts_store_query() {
        let (service, _) = setup_service().await;
        let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
        ctx.cancel();

        let err = service
            .translate(&ctx, &OpaqueHandle::new("anything"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled(_)));
    }

    /// Authenticator whose answer never arrives.
    struct StalledAuthenticator;

    impl UserAuthenticator for StalledAuthenticator {
        fn authenticate(
            &self,
            _ctx: &CallContext,
            _login: &str,
            _password: &str,
        ) -> impl Future<Output = GatewayResult<AuthenticatedUser>> + Send {
            std::future::pending()
        }
    }

    #[tokio::test]
    async fn test_sign_in_gives_up_on_stalled_authenticator() {
        let db = create_connection(DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        ensure_schema(&db).await.unwrap();
        let issuer = Arc::new(TokenIssuer::new(b"session-secret", TokenIssuer::DEFAULT_LIFETIME).unwrap());
        let service = GatewaySessionService::new(StalledAuthenticator, issuer, SessionStore::new(db));

        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            service.sign_in(&ctx, "alice", "wonderland"),
        )
        .await
        .expect("sign-in must honour the request deadline")
        .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled(_)));
    }
}
