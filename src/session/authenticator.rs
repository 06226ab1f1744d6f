//! Credential checks delegated to the `user` backend.

use std::sync::Arc;

use crate::auth::CallContext;
use crate::dispatch::ServiceDispatcher;
use crate::error::{GatewayError, GatewayResult};
use crate::services::user::{Authenticate, Credentials};
use crate::session::service::{AuthenticatedUser, UserAuthenticator};

/// [`UserAuthenticator`] that calls `user.Authenticate` through the
/// dispatcher.
///
/// Unknown logins and malformed credentials both come back as
/// [`GatewayError::Authentication`] so callers cannot probe which accounts
/// exist. Transport failures pass through unchanged.
#[derive(Clone)]
pub struct DispatchAuthenticator {
    dispatcher: Arc<ServiceDispatcher>,
}

impl DispatchAuthenticator {
    pub fn new(dispatcher: Arc<ServiceDispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl UserAuthenticator for DispatchAuthenticator {
    async fn authenticate(
        &self,
        ctx: &CallContext,
        login: &str,
        password: &str,
    ) -> GatewayResult<AuthenticatedUser> {
        let credentials = Credentials {
            login: login.to_string(),
            password: password.to_string(),
        };

        match self.dispatcher.call::<Authenticate>(ctx, credentials).await {
            Ok(user) => Ok(user),
            Err(GatewayError::NotFound(_) | GatewayError::Validation(_)) => {
                Err(GatewayError::Authentication)
            }
            Err(e) => Err(e),
        }
    }
}
