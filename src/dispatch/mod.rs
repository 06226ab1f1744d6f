//! Resolve, balance and retry calls to backend services.

pub mod consul;
pub mod endpointer;
pub mod instancer;
pub mod limiter;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::CallContext;
use crate::config::{DispatcherConfig, ServiceSpec};
use crate::error::{GatewayError, GatewayResult};
use crate::rpc::{Operation, ServiceDescriptor};
use crate::types::{InstanceAddress, ServiceName};

pub use consul::{ConsulRegistry, ServiceInstance};
pub use endpointer::Endpointer;
pub use instancer::{InstanceSnapshot, Instancer};
pub use limiter::TokenBucket;

/// Routes typed operations to live instances of their service.
///
/// Every logical call picks an instance round-robin from the current
/// snapshot and is retried on transport failures up to `max_retries`
/// attempts, each bounded by the per-attempt timeout and by the caller's
/// remaining deadline.
pub struct ServiceDispatcher {
    config: Arc<DispatcherConfig>,
    specs: Vec<ServiceSpec>,
    endpointers: HashMap<ServiceName, Arc<Endpointer>>,
}

impl ServiceDispatcher {
    pub fn new(config: DispatcherConfig, specs: Vec<ServiceSpec>) -> Self {
        let config = Arc::new(config);
        let endpointers = specs
            .iter()
            .map(|spec| {
                let instancer = Instancer::new(spec.name.clone());
                (
                    spec.name.clone(),
                    Arc::new(Endpointer::new(instancer, config.clone())),
                )
            })
            .collect();

        Self {
            config,
            specs,
            endpointers,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Instance holder for `service`, for registry feeds and static setups.
    pub fn instancer(&self, service: &str) -> Option<&Instancer> {
        self.endpointers.get(service).map(|e| e.instancer())
    }

    /// Current live addresses of `service`. Unknown services resolve to
    /// nothing.
    pub fn resolve(&self, service: &str) -> Vec<InstanceAddress> {
        self.instancer(service)
            .map(|i| i.snapshot().addresses.clone())
            .unwrap_or_default()
    }

    /// Start one registry watcher per configured service.
    pub fn spawn_watchers(
        &self,
        registry: ConsulRegistry,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.specs
            .iter()
            .filter_map(|spec| {
                let instancer = self.instancer(spec.name.as_str())?.clone();
                Some(tokio::spawn(registry.clone().watch(
                    spec.clone(),
                    instancer,
                    shutdown.clone(),
                )))
            })
            .collect()
    }

    /// Wait for watchers started by [`spawn_watchers`](Self::spawn_watchers).
    ///
    /// Returns how many ended by panicking or being aborted.
    pub async fn join_watchers(watchers: Vec<JoinHandle<()>>) -> usize {
        let mut abnormal = 0;
        for watcher in watchers {
            if let Err(e) = watcher.await {
                warn!("Registry watcher ended abnormally: {}", e);
                abnormal += 1;
            }
        }
        abnormal
    }

    /// Call `Op` on some live instance of its service.
    pub async fn call<Op: Operation>(
        &self,
        ctx: &CallContext,
        request: Op::Request,
    ) -> GatewayResult<Op::Response> {
        let service = <Op::Service as ServiceDescriptor>::REGISTRY_NAME;
        let endpointer = self.endpointers.get(service).ok_or_else(|| {
            GatewayError::Transport(format!("service {} is not configured", service))
        })?;

        // backon counts retries, not attempts.
        let max_attempts = self.config.max_retries.max(1);
        let backoff = ConstantBuilder::default()
            .with_delay(Duration::ZERO)
            .with_max_times(max_attempts - 1);

        let per_attempt = self.config.per_attempt_timeout();
        let attempts = AtomicUsize::new(0);
        let stranded = AtomicBool::new(false);
        let last_error: Mutex<Option<String>> = Mutex::new(None);

        let run_attempt = || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;

            let Some(client) = endpointer.next() else {
                stranded.store(true, Ordering::SeqCst);
                let previous = last_error.lock().take();
                return Err(match previous {
                    None => GatewayError::Transport(format!("no live instances of {}", service)),
                    Some(e) => GatewayError::Transport(format!(
                        "no live instances of {} after {} attempts: {}",
                        service,
                        attempt - 1,
                        e
                    )),
                });
            };

            let budget = match ctx.remaining() {
                Some(left) if left.is_zero() => {
                    return Err(GatewayError::Cancelled("deadline exceeded".to_string()));
                }
                Some(left) => left.min(per_attempt),
                None => per_attempt,
            };

            let outcome = ctx
                .scoped(async {
                    match tokio::time::timeout(
                        budget,
                        client.call::<Op>(ctx, request.clone(), budget),
                    )
                    .await
                    {
                        Ok(res) => res,
                        Err(_) => Err(GatewayError::Transport(format!(
                            "attempt timed out after {:?}",
                            budget
                        ))),
                    }
                })
                .await;

            match &outcome {
                Ok(_) => debug!(
                    request_id = %ctx.request_id(),
                    service,
                    method = Op::METHOD,
                    instance = %client.address(),
                    attempt,
                    "Call succeeded"
                ),
                Err(e) if e.is_retryable() => warn!(
                    request_id = %ctx.request_id(),
                    service,
                    method = Op::METHOD,
                    instance = %client.address(),
                    attempt,
                    error = %e,
                    "Call attempt failed"
                ),
                Err(_) => {}
            }
            outcome
        };

        run_attempt
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(|e: &GatewayError| e.is_retryable() && !stranded.load(Ordering::SeqCst))
            .notify(|e: &GatewayError, _| {
                *last_error.lock() = Some(e.to_string());
            })
            .await
            .map_err(|e| {
                if e.is_retryable() && !stranded.load(Ordering::SeqCst) {
                    GatewayError::Transport(format!(
                        "{}: retry budget exhausted after {} attempts: {}",
                        service,
                        attempts.load(Ordering::SeqCst),
                        e
                    ))
                } else {
                    e
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Access, DownstreamAuthGuard, TokenIssuer};
    use crate::config::RateLimitConfig;
    use crate::rpc::{RpcServer, operation, serve, service};
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    service!(EchoService = "test.Echo", registry = "echo");
    operation!(Echo on EchoService, "Echo", String => String);

    service!(UnknownService = "test.Unknown", registry = "unknown");
    operation!(Nothing on UnknownService, "Nothing", String => String);

    fn dispatcher(max_retries: usize, per_attempt_timeout_ms: u64) -> ServiceDispatcher {
        limited_dispatcher(max_retries, per_attempt_timeout_ms, RateLimitConfig::default())
    }

    fn limited_dispatcher(
        max_retries: usize,
        per_attempt_timeout_ms: u64,
        rate_limit: RateLimitConfig,
    ) -> ServiceDispatcher {
        ServiceDispatcher::new(
            DispatcherConfig {
                max_retries,
                per_attempt_timeout_ms,
                connect_timeout_ms: 100,
                idle_timeout_secs: 300,
                registry_wait_secs: 1,
                rate_limit,
            },
            vec![ServiceSpec::new("echo")],
        )
    }

    async fn spawn_echo(shutdown: &CancellationToken) -> InstanceAddress {
        let issuer = Arc::new(TokenIssuer::new(b"echo-secret", TokenIssuer::DEFAULT_LIFETIME).unwrap());
        let server = RpcServer::<EchoService>::builder(DownstreamAuthGuard::new(issuer))
            .route::<Echo, _, _>(Access::Public, |_, msg: String| async move {
                Ok::<_, GatewayError>(msg)
            })
            .build();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(server, listener, shutdown.clone()));
        InstanceAddress::new(addr.to_string())
    }

    #[tokio::test]
    async fn test_resolve_unknown_or_empty_service() {
        let dispatcher = dispatcher(3, 100);
        assert!(dispatcher.resolve("echo").is_empty());
        assert!(dispatcher.resolve("nope").is_empty());

        dispatcher
            .instancer("echo")
            .unwrap()
            .update(vec![InstanceAddress::new("127.0.0.1:1")]);
        assert_eq!(dispatcher.resolve("echo"), vec![InstanceAddress::new("127.0.0.1:1")]);
    }

    #[tokio::test]
    async fn test_zero_instances_fail_fast() {
        let dispatcher = dispatcher(5, 2_000);
        let started = Instant::now();

        let err = dispatcher
            .call::<Echo>(&CallContext::new(), "hi".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Transport(ref m) if m.contains("no live instances")));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_unconfigured_service_is_transport_error() {
        let err = dispatcher(3, 100)
            .call::<Nothing>(&CallContext::new(), String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
    }

    #[tokio::test]
    async fn test_unreachable_instances_exhaust_retries_into_one_error() {
        let dispatcher = dispatcher(3, 500);
        // Reserved port with nothing listening.
        dispatcher.instancer("echo").unwrap().update(vec![
            InstanceAddress::new("127.0.0.1:1"),
            InstanceAddress::new("127.0.0.1:2"),
        ]);

        let err = dispatcher
            .call::<Echo>(&CallContext::new(), "hi".to_string())
            .await
            .unwrap_err();

        match err {
            GatewayError::Transport(msg) => {
                assert!(msg.contains("retry budget exhausted after 3 attempts"), "{}", msg)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_request_stops_dispatch() {
        let dispatcher = dispatcher(3, 500);
        dispatcher
            .instancer("echo")
            .unwrap()
            .update(vec![InstanceAddress::new("127.0.0.1:1")]);

        let ctx = CallContext::new();
        ctx.cancel();
        let err = dispatcher
            .call::<Echo>(&ctx, "hi".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_expired_deadline_stops_dispatch() {
        let dispatcher = dispatcher(3, 500);
        dispatcher
            .instancer("echo")
            .unwrap()
            .update(vec![InstanceAddress::new("127.0.0.1:1")]);

        let ctx = CallContext::new().with_timeout(Duration::ZERO);
        let err = dispatcher
            .call::<Echo>(&ctx, "hi".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_rate_limited_instance_fails_without_waiting() {
        let shutdown = CancellationToken::new();
        let dispatcher = limited_dispatcher(
            3,
            2_000,
            RateLimitConfig {
                refill_per_sec: 1.0,
                burst: 1,
            },
        );
        dispatcher
            .instancer("echo")
            .unwrap()
            .update(vec![spawn_echo(&shutdown).await]);

        let first = dispatcher
            .call::<Echo>(&CallContext::new(), "one".to_string())
            .await
            .unwrap();
        assert_eq!(first, "one");

        let started = Instant::now();
        let err = dispatcher
            .call::<Echo>(&CallContext::new(), "two".to_string())
            .await
            .unwrap_err();

        match err {
            GatewayError::Transport(msg) => {
                assert!(msg.contains("rate limit exceeded"), "{}", msg)
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_millis(200));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_join_watchers_counts_failed_tasks() {
        let finished = tokio::spawn(async {});
        let panicked: JoinHandle<()> = tokio::spawn(async { panic!("watcher blew up") });
        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();

        let abnormal = ServiceDispatcher::join_watchers(vec![finished, panicked, aborted]).await;
        assert_eq!(abnormal, 2);
    }
}
