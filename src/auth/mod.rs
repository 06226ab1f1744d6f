//! Signed identity assertions and their propagation.
//!
//! - [`TokenIssuer`] signs and validates assertions.
//! - [`CallContext`] carries the translated identity through one request.
//! - [`IdentityInjector`] / [`IdentityExtractor`] move it across the RPC boundary.
//! - [`DownstreamAuthGuard`] decides, per operation, whether a call may proceed.

pub mod claims;
pub mod context;
pub mod guard;
pub mod interceptor;
pub mod issuer;

pub use claims::{Claims, Role};
pub use context::{CallContext, Identity};
pub use guard::{Access, Caller, DownstreamAuthGuard};
pub use interceptor::{
    AUTHORIZATION_METADATA_KEY, ForwardedIdentity, IdentityExtractor, IdentityInjector,
};
pub use issuer::TokenIssuer;
