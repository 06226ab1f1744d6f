//! Request handlers of the public router.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::Extension;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::api::AppState;
use crate::api::middleware::{OPAQUE_HEADER, opaque_handle};
use crate::auth::CallContext;
use crate::error::{GatewayError, GatewayResult};
use crate::rpc::Operation;
use crate::session::{SignInResponse, UserAuthenticator};

#[derive(Deserialize)]
pub struct SignInRequest {
    pub login: String,
    pub password: String,
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> GatewayResult<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| GatewayError::Validation(rejection.body_text()))
}

pub async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// `POST /signin`
pub async fn sign_in<A: UserAuthenticator>(
    State(state): State<AppState<A>>,
    body: Result<Json<SignInRequest>, JsonRejection>,
) -> GatewayResult<Json<SignInResponse>> {
    let request = json_body(body)?;
    let ctx = CallContext::new().with_timeout(state.request_timeout);
    let _cancel_on_drop = ctx.cancellation().clone().drop_guard();

    let response = state
        .sessions
        .sign_in(&ctx, &request.login, &request.password)
        .await?;
    Ok(Json(response))
}

/// `GET /logout`
pub async fn logout<A: UserAuthenticator>(
    State(state): State<AppState<A>>,
    headers: HeaderMap,
) -> GatewayResult<Json<Value>> {
    let handle = opaque_handle(&headers).ok_or_else(|| {
        debug!("Logout without {}", OPAQUE_HEADER);
        GatewayError::Authentication
    })?;

    let ctx = CallContext::new().with_timeout(state.request_timeout);
    let _cancel_on_drop = ctx.cancellation().clone().drop_guard();

    match state.sessions.logout(&ctx, &handle).await {
        Ok(()) => Ok(Json(serde_json::json!({ "message": "ok" }))),
        Err(GatewayError::NotFound(_)) => Err(GatewayError::Authentication),
        Err(e) => Err(e),
    }
}

/// Forward a JSON body to `Op` on some instance of its service.
///
/// The call context, identity included, comes from
/// [`propagate_identity`](crate::api::middleware::propagate_identity).
pub async fn forward<A: UserAuthenticator, Op: Operation>(
    State(state): State<AppState<A>>,
    Extension(ctx): Extension<CallContext>,
    body: Result<Json<Op::Request>, JsonRejection>,
) -> GatewayResult<Json<Op::Response>> {
    let request = json_body(body)?;
    let response = state.dispatcher.call::<Op>(&ctx, request).await?;
    Ok(Json(response))
}
