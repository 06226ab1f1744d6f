use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use session_gateway::rpc::serve;
use session_gateway::services::user::NewUser;
use session_gateway::services::{
    InMemoryNotifications, InMemorySupport, InMemoryUsers, auth_server, notifications_server,
    support_server, user_server,
};
use session_gateway::{
    DatabaseConfig, DownstreamAuthGuard, GatewayConfig, InstanceAddress, ServiceDispatcher,
    TokenIssuer, create_gateway,
};

#[derive(Parser)]
#[command(name = "session-gateway")]
#[command(about = "Session-translating API gateway and its backend services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    Auth,
    User,
    Notifications,
    Support,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public HTTP gateway
    Gateway {
        #[arg(long, env = "GATEWAY_BIND", default_value = "0.0.0.0:8080")]
        bind: String,
        #[arg(long, env = "SURREALDB_URL", default_value = "memory")]
        db_url: String,
        /// Consul agent used to resolve backends
        #[arg(long, env = "CONSUL_HTTP_ADDR", default_value = "http://127.0.0.1:8500")]
        registry_url: String,
        #[arg(long, env = "GATEWAY_JWT_SECRET", hide_env_values = true)]
        jwt_secret: String,
        /// Static backend instance, `service=host:port`; repeatable. Disables
        /// registry lookups when given.
        #[arg(long = "instance", value_parser = parse_instance)]
        instances: Vec<(String, String)>,
    },
    /// Run one backend service over RPC
    Serve {
        #[arg(value_enum)]
        backend: Backend,
        #[arg(long, default_value = "0.0.0.0:9090")]
        bind: String,
        #[arg(long, env = "GATEWAY_JWT_SECRET", hide_env_values = true)]
        jwt_secret: String,
        /// Seed an admin account (user backend only)
        #[arg(long, requires = "admin_password")]
        admin_email: Option<String>,
        #[arg(long, env = "GATEWAY_ADMIN_PASSWORD", hide_env_values = true)]
        admin_password: Option<String>,
    },
    /// Initialize the session store schema
    Init {
        #[arg(long, default_value = "memory")]
        db_url: String,
    },
}

fn parse_instance(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((service, addr)) if !service.is_empty() && !addr.is_empty() => {
            Ok((service.to_string(), addr.to_string()))
        }
        _ => Err(format!("expected service=host:port, got '{}'", raw)),
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        trigger.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("session_gateway=info".parse()?)
                .add_directive("surrealdb=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Gateway {
            bind,
            db_url,
            registry_url,
            jwt_secret,
            instances,
        } => {
            let config = GatewayConfig {
                bind,
                signing_secret: jwt_secret,
                registry_url,
                database: DatabaseConfig {
                    url: db_url,
                    ..Default::default()
                },
                ..Default::default()
            };
            info!("Using database url for session store: {}", config.database.url);

            let shutdown = shutdown_on_ctrl_c();
            let gateway = create_gateway(config.clone(), instances.is_empty(), shutdown.clone()).await?;

            if !instances.is_empty() {
                let mut by_service: HashMap<String, Vec<InstanceAddress>> = HashMap::new();
                for (service, addr) in instances {
                    by_service
                        .entry(service)
                        .or_default()
                        .push(InstanceAddress::new(addr));
                }
                for (service, addrs) in by_service {
                    match gateway.dispatcher.instancer(&service) {
                        Some(instancer) => {
                            instancer.update(addrs);
                        }
                        None => warn!(service = %service, "Ignoring instances of unknown service"),
                    }
                }
            } else {
                info!("Resolving backends through registry at {}", config.registry_url);
            }

            let listener = tokio::net::TcpListener::bind(&config.bind).await?;
            info!("Gateway listening on http://{}", config.bind);

            axum::serve(listener, gateway.router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await?;

            ServiceDispatcher::join_watchers(gateway.watchers).await;
        }
        Commands::Serve {
            backend,
            bind,
            jwt_secret,
            admin_email,
            admin_password,
        } => {
            let config = GatewayConfig::default();
            let issuer = Arc::new(TokenIssuer::new(
                jwt_secret.as_bytes(),
                config.assertion_lifetime(),
            )?);
            let guard = DownstreamAuthGuard::new(issuer.clone());

            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("binding {}", bind))?;
            let shutdown = shutdown_on_ctrl_c();
            info!("Starting {:?} backend on {}", backend, bind);

            match backend {
                Backend::Auth => serve(auth_server(issuer, guard), listener, shutdown).await?,
                Backend::User => {
                    let users = InMemoryUsers::new();
                    if let (Some(email), Some(password)) = (admin_email, admin_password) {
                        let admin = users.seed_admin(NewUser {
                            login: email.clone(),
                            email,
                            password,
                            contacts: String::new(),
                        })?;
                        info!(user_id = admin.id, "Seeded admin account");
                    }
                    serve(user_server(Arc::new(users), guard), listener, shutdown).await?
                }
                Backend::Notifications => {
                    serve(
                        notifications_server(Arc::new(InMemoryNotifications::new()), guard),
                        listener,
                        shutdown,
                    )
                    .await?
                }
                Backend::Support => {
                    serve(
                        support_server(Arc::new(InMemorySupport::new()), guard),
                        listener,
                        shutdown,
                    )
                    .await?
                }
            }
        }
        Commands::Init { db_url } => {
            let db_config = DatabaseConfig {
                url: db_url,
                ..Default::default()
            };
            info!("Using database url for initialization: {}", db_config.url);

            info!("Initializing database...");
            let db = session_gateway::create_connection(db_config).await?;
            session_gateway::ensure_schema(&db).await?;
            info!("Database initialized successfully");
        }
    }

    Ok(())
}
