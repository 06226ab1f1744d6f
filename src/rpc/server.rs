//! Typed RPC server assembled from guarded routes.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tonic::body::BoxBody;
use tonic::codegen::{Body, BoxFuture, StdError};
use tonic::server::NamedService;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::interceptor::InterceptedService;
use tower::Service;
use tracing::{debug, info};

use crate::auth::{Access, Caller, DownstreamAuthGuard, IdentityExtractor};
use crate::error::GatewayResult;
use crate::rpc::codec::BincodeCodec;
use crate::rpc::{Operation, ServiceDescriptor};

type Route = Arc<
    dyn Fn(http::Request<BoxBody>) -> BoxFuture<http::Response<BoxBody>, Infallible> + Send + Sync,
>;

/// Collects the routes of one service.
pub struct RpcServerBuilder<S> {
    guard: DownstreamAuthGuard,
    routes: HashMap<String, Route>,
    _service: PhantomData<fn() -> S>,
}

impl<S: ServiceDescriptor> RpcServerBuilder<S> {
    /// Mount `handler` for `Op`. The guard runs first with `access`; the
    /// handler only sees admitted calls.
    pub fn route<Op, F, Fut>(mut self, access: Access, handler: F) -> Self
    where
        Op: Operation<Service = S>,
        F: Fn(Caller, Op::Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GatewayResult<Op::Response>> + Send + 'static,
    {
        let guard = self.guard.clone();
        let handler = Arc::new(handler);

        let route: Route = Arc::new(move |req: http::Request<BoxBody>| -> BoxFuture<
            http::Response<BoxBody>,
            Infallible,
        > {
            let guard = guard.clone();
            let handler = handler.clone();

            Box::pin(async move {
                let method = tower::service_fn(move |request: tonic::Request<Op::Request>| {
                    let guard = guard.clone();
                    let handler = handler.clone();
                    async move {
                        let caller = guard.admit(access, &request).map_err(|e| {
                            debug!(method = Op::METHOD, error = %e, "Call rejected by guard");
                            e.to_status()
                        })?;
                        handler(caller, request.into_inner())
                            .await
                            .map(tonic::Response::new)
                            .map_err(|e| e.to_status())
                    }
                });

                let mut grpc =
                    tonic::server::Grpc::new(BincodeCodec::<Op::Response, Op::Request>::default());
                Ok(grpc.unary(method, req).await)
            })
        });

        self.routes.insert(Op::path(), route);
        self
    }

    pub fn build(self) -> RpcServer<S> {
        RpcServer {
            routes: Arc::new(self.routes),
            _service: PhantomData,
        }
    }
}

/// A tonic service dispatching on request path to typed routes.
pub struct RpcServer<S> {
    routes: Arc<HashMap<String, Route>>,
    _service: PhantomData<fn() -> S>,
}

impl<S: ServiceDescriptor> RpcServer<S> {
    pub fn builder(guard: DownstreamAuthGuard) -> RpcServerBuilder<S> {
        RpcServerBuilder {
            guard,
            routes: HashMap::new(),
            _service: PhantomData,
        }
    }

    /// Paths this server answers.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Wrap the server so every call first records its forwarded identity.
    pub fn intercepted(self) -> InterceptedService<Self, IdentityExtractor> {
        InterceptedService::new(self, IdentityExtractor)
    }
}

/// Serve `server` on an already bound listener until `shutdown` fires.
pub async fn serve<S: ServiceDescriptor>(
    server: RpcServer<S>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    info!(
        service = S::NAME,
        addr = ?listener.local_addr().ok(),
        "Serving RPC"
    );
    tonic::transport::Server::builder()
        .add_service(server.intercepted())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.cancelled().await
        })
        .await
}

impl<S> Clone for RpcServer<S> {
    fn clone(&self) -> Self {
        Self {
            routes: self.routes.clone(),
            _service: PhantomData,
        }
    }
}

impl<S: ServiceDescriptor> NamedService for RpcServer<S> {
    const NAME: &'static str = S::NAME;
}

impl<S, B> Service<http::Request<B>> for RpcServer<S>
where
    S: ServiceDescriptor,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match self.routes.get(req.uri().path()) {
            Some(route) => route(req.map(tonic::body::boxed)),
            None => {
                let path = req.uri().path().to_string();
                Box::pin(async move {
                    Ok(tonic::Status::unimplemented(format!("unknown method {}", path))
                        .into_http())
                })
            }
        }
    }
}
