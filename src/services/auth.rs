//! Assertion issuing service.
//!
//! Signs and checks assertions for backends that do not hold the shared
//! secret themselves. The gateway keeps its own [`TokenIssuer`] and never
//! routes `Generate` to the public surface; on the RPC port minting is
//! restricted to callers already holding an ADMIN assertion.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{Access, Claims, DownstreamAuthGuard, Role, TokenIssuer};
use crate::rpc::{RpcServer, operation, service};
use crate::types::SignedAssertion;

service!(AuthService = "gateway.auth.AuthService", registry = "auth");

operation!(
    /// Sign an assertion for a user.
    Generate on AuthService, "Generate", GenerateRequest => GenerateResponse
);

operation!(
    /// Decode and check an assertion.
    Validate on AuthService, "Validate", ValidateRequest => Claims
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub user_id: i64,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub token: SignedAssertion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub token: SignedAssertion,
}

pub fn auth_server(issuer: Arc<TokenIssuer>, guard: DownstreamAuthGuard) -> RpcServer<AuthService> {
    let generate_issuer = issuer.clone();
    let validate_issuer = issuer;

    RpcServer::builder(guard)
        .route::<Generate, _, _>(Access::Role(Role::Admin), move |_, req: GenerateRequest| {
            let result = generate_issuer
                .generate(req.user_id, req.role)
                .map(|token| GenerateResponse { token });
            debug!(user_id = req.user_id, ok = result.is_ok(), "Generate");
            async move { result }
        })
        .route::<Validate, _, _>(Access::Public, move |_, req: ValidateRequest| {
            let result = validate_issuer.validate(req.token.as_str());
            async move { result }
        })
        .build()
}
