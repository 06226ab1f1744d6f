//! Opaque handle to signed assertion translation for `/v1`.

use axum::Json;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::api::AppState;
use crate::auth::CallContext;
use crate::error::NOT_AUTHORIZED;
use crate::session::UserAuthenticator;
use crate::types::OpaqueHandle;

/// Header carrying the client's opaque handle. Never forwarded.
pub const OPAQUE_HEADER: &str = "x-opaque";

/// Path fragments reachable without a session.
pub const EXEMPT_PATHS: [&str; 2] = ["/auth", "/user/create"];

pub fn is_exempt(path: &str) -> bool {
    EXEMPT_PATHS.iter().any(|fragment| path.contains(fragment))
}

/// Non-empty opaque handle from `headers`, if any.
pub fn opaque_handle(headers: &HeaderMap) -> Option<OpaqueHandle> {
    headers
        .get(OPAQUE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(OpaqueHandle::new)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": NOT_AUTHORIZED })),
    )
        .into_response()
}

/// Attach a [`CallContext`] to every `/v1` request.
///
/// Exempt paths proceed anonymously. Everything else must present a live
/// handle in `X-Opaque`; the handle is swapped for its signed assertion,
/// which then travels in the context and in the `Authorization` header.
/// The context is cancelled as soon as this request finishes or is dropped.
pub async fn propagate_identity<A: UserAuthenticator>(
    State(state): State<AppState<A>>,
    mut request: Request,
    next: Next,
) -> Response {
    let ctx = CallContext::new().with_timeout(state.request_timeout);
    let _cancel_on_drop = ctx.cancellation().clone().drop_guard();

    let handle = opaque_handle(request.headers());
    request.headers_mut().remove(OPAQUE_HEADER);

    if is_exempt(request.uri().path()) {
        request.extensions_mut().insert(ctx);
        return next.run(request).await;
    }

    let Some(handle) = handle else {
        debug!(path = %request.uri().path(), "Request without opaque handle");
        return unauthorized();
    };

    let assertion = match state.sessions.translate(&ctx, &handle).await {
        Ok(assertion) => assertion,
        Err(e) => {
            debug!(
                request_id = %ctx.request_id(),
                handle = %handle.fingerprint(),
                error = %e,
                "Handle translation rejected"
            );
            return unauthorized();
        }
    };

    match HeaderValue::from_str(assertion.as_str()) {
        Ok(value) => {
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Err(_) => return unauthorized(),
    }

    request.extensions_mut().insert(ctx.with_assertion(assertion));
    next.run(request).await
}
