// Core modules
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod types;

// Session translation and request dispatch
pub mod api;
pub mod dispatch;
pub mod rpc;
pub mod services;
pub mod session;

// Re-export key types and functions
pub use auth::{Access, CallContext, Caller, Claims, DownstreamAuthGuard, Role, TokenIssuer};
pub use config::{DispatcherConfig, GatewayConfig, RateLimitConfig, ServiceSpec};
pub use db::{DatabaseConfig, create_connection, ensure_schema};
pub use dispatch::{ConsulRegistry, ServiceDispatcher};
pub use error::{GatewayError, GatewayResult, TokenFault};
pub use session::{DispatchAuthenticator, GatewaySessionService, SessionStore};
pub use types::{InstanceAddress, OpaqueHandle, ServiceName, SignedAssertion};

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A fully wired gateway: public router plus the registry watchers feeding
/// its dispatcher.
pub struct Gateway {
    pub router: Router,
    pub dispatcher: Arc<ServiceDispatcher>,
    pub watchers: Vec<JoinHandle<()>>,
}

/// Build the gateway from configuration.
///
/// Connects the session store, creates the issuer and the dispatcher, and
/// starts one registry watcher per configured service unless `watch_registry`
/// is off (static instance lists).
pub async fn create_gateway(
    config: GatewayConfig,
    watch_registry: bool,
    shutdown: CancellationToken,
) -> Result<Gateway> {
    let issuer = Arc::new(TokenIssuer::new(
        config.signing_secret.as_bytes(),
        config.assertion_lifetime(),
    )?);

    let db = create_connection(config.database.clone()).await?;
    ensure_schema(&db).await?;

    let dispatcher = Arc::new(ServiceDispatcher::new(
        config.dispatcher.clone(),
        config.services.clone(),
    ));

    let watchers = if watch_registry {
        let registry = ConsulRegistry::new(&config.registry_url, config.dispatcher.registry_wait())?;
        dispatcher.spawn_watchers(registry, shutdown)
    } else {
        Vec::new()
    };

    let sessions = Arc::new(GatewaySessionService::new(
        DispatchAuthenticator::new(dispatcher.clone()),
        issuer,
        SessionStore::new(db),
    ));

    let router = api::create_public_router(api::AppState {
        sessions,
        dispatcher: dispatcher.clone(),
        request_timeout: config.request_timeout(),
    });

    Ok(Gateway {
        router,
        dispatcher,
        watchers,
    })
}
