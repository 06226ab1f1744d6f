// Public HTTP surface of the gateway

pub mod handlers;
pub mod middleware;


use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatch::ServiceDispatcher;
use crate::services::{auth, notifications, support, user};
use crate::session::{GatewaySessionService, UserAuthenticator};

use handlers::{forward, health_check, logout, sign_in};

/// Shared state of the public router.
pub struct AppState<A> {
    pub sessions: Arc<GatewaySessionService<A>>,
    pub dispatcher: Arc<ServiceDispatcher>,
    /// Upper bound on one inbound request, outbound calls included.
    pub request_timeout: Duration,
}

impl<A> Clone for AppState<A> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            dispatcher: self.dispatcher.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

/// Routes under `/v1`, one per forwarded backend operation.
fn v1_router<A: UserAuthenticator>(state: AppState<A>) -> Router<AppState<A>> {
    Router::new()
        // Token minting stays internal; only validation is public.
        .route("/auth/validate", post(forward::<A, auth::Validate>))
        .route("/user/auth", post(forward::<A, user::Authenticate>))
        .route("/user/create", post(forward::<A, user::CreateUser>))
        .route("/user/findByEmail", post(forward::<A, user::FindUserByEmail>))
        .route("/user/findById", post(forward::<A, user::FindUserById>))
        .route("/user/update", post(forward::<A, user::UpdateUser>))
        .route(
            "/notifications/create",
            post(forward::<A, notifications::CreateNotification>),
        )
        .route(
            "/notifications/findById",
            post(forward::<A, notifications::ListNotifications>),
        )
        .route(
            "/notifications/check",
            post(forward::<A, notifications::CheckNotifications>),
        )
        .route("/support/ticket/create", post(forward::<A, support::CreateTicket>))
        .route("/support/ticket/get", post(forward::<A, support::GetTicket>))
        .route("/support/ticket/all", post(forward::<A, support::ListTickets>))
        .route("/support/ticket/accept", post(forward::<A, support::AcceptTicket>))
        .route("/support/ticket/status", post(forward::<A, support::ChangeStatus>))
        .route("/support/message/add", post(forward::<A, support::AddMessage>))
        .route("/support/message/get", post(forward::<A, support::GetMessages>))
        .route_layer(axum::middleware::from_fn_with_state(
            state,
            middleware::propagate_identity::<A>,
        ))
}

pub fn create_public_router<A: UserAuthenticator>(state: AppState<A>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/signin", post(sign_in::<A>))
        .route("/logout", get(logout::<A>))
        .nest("/v1", v1_router(state.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
