//! Identity propagation across the HTTP to RPC boundary.
//!
//! The gateway side attaches the translated assertion to outbound metadata
//! with [`IdentityInjector`]. Backends run [`IdentityExtractor`] in front of
//! every service; it never rejects, it only records what it found so the
//! per-operation guard can decide.

use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::types::SignedAssertion;

/// Lower-cased metadata key carrying the signed assertion.
pub const AUTHORIZATION_METADATA_KEY: &str = "authorization";

/// What the server-side interceptor saw on an inbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardedIdentity {
    /// No `authorization` metadata was present.
    Missing,
    Present(SignedAssertion),
}

/// Client-side interceptor writing the assertion into call metadata.
#[derive(Debug, Clone, Default)]
pub struct IdentityInjector {
    assertion: Option<SignedAssertion>,
}

impl IdentityInjector {
    pub fn new(assertion: Option<SignedAssertion>) -> Self {
        Self { assertion }
    }
}

impl Interceptor for IdentityInjector {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(assertion) = &self.assertion {
            let value = MetadataValue::try_from(assertion.as_str())
                .map_err(|_| Status::invalid_argument("assertion is not valid metadata"))?;
            request
                .metadata_mut()
                .insert(AUTHORIZATION_METADATA_KEY, value);
        }
        Ok(request)
    }
}

/// Server-side interceptor recording the forwarded identity as a request
/// extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityExtractor;

impl Interceptor for IdentityExtractor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let forwarded = request
            .metadata()
            .get(AUTHORIZATION_METADATA_KEY)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| ForwardedIdentity::Present(SignedAssertion::new(v)))
            .unwrap_or(ForwardedIdentity::Missing);

        request.extensions_mut().insert(forwarded);
        Ok(request)
    }
}
