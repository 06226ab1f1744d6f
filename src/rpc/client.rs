//! Typed client for one backend instance.

use std::time::{Duration, Instant};

use http::uri::PathAndQuery;
use parking_lot::Mutex;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

use crate::auth::{CallContext, IdentityInjector};
use crate::config::DispatcherConfig;
use crate::dispatch::limiter::TokenBucket;
use crate::error::{GatewayError, GatewayResult};
use crate::rpc::Operation;
use crate::rpc::codec::BincodeCodec;
use crate::types::InstanceAddress;

/// Client bound to a single instance address.
///
/// The underlying channel connects lazily on first use and reconnects on its
/// own; one client is reused for as long as its address stays registered.
#[derive(Debug)]
pub struct RpcClient {
    address: InstanceAddress,
    channel: Channel,
    limiter: Mutex<TokenBucket>,
    last_used: Mutex<Instant>,
}

impl RpcClient {
    pub fn connect_lazy(
        address: InstanceAddress,
        config: &DispatcherConfig,
    ) -> GatewayResult<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(|e| {
                GatewayError::Transport(format!("invalid instance address {}: {}", address, e))
            })?
            .connect_timeout(config.connect_timeout());

        Ok(Self {
            channel: endpoint.connect_lazy(),
            limiter: Mutex::new(TokenBucket::new(config.rate_limit)),
            last_used: Mutex::new(Instant::now()),
            address,
        })
    }

    pub fn address(&self) -> &InstanceAddress {
        &self.address
    }

    /// Time since the client last sent a call.
    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Send one unary call carrying the context's identity.
    ///
    /// `timeout` is forwarded to the server as the call deadline.
    pub async fn call<Op: Operation>(
        &self,
        ctx: &CallContext,
        request: Op::Request,
        timeout: Duration,
    ) -> GatewayResult<Op::Response> {
        if !self.limiter.lock().try_acquire() {
            return Err(GatewayError::Transport(format!(
                "rate limit exceeded for {}",
                self.address
            )));
        }
        *self.last_used.lock() = Instant::now();

        let path = PathAndQuery::try_from(Op::path())
            .map_err(|e| GatewayError::Internal(format!("invalid method path: {}", e)))?;

        let mut request = tonic::Request::new(request);
        request.set_timeout(timeout);

        let service = InterceptedService::new(
            self.channel.clone(),
            IdentityInjector::new(ctx.assertion().cloned()),
        );
        let mut grpc = tonic::client::Grpc::new(service);
        grpc.ready().await.map_err(|e| {
            GatewayError::Transport(format!("{} is not ready: {}", self.address, e))
        })?;

        debug!(
            request_id = %ctx.request_id(),
            instance = %self.address,
            method = Op::METHOD,
            "Sending RPC"
        );

        let response = grpc
            .unary(
                request,
                path,
                BincodeCodec::<Op::Request, Op::Response>::default(),
            )
            .await?;

        Ok(response.into_inner())
    }
}
