//! Consul health-endpoint watcher feeding [`Instancer`]s.
//!
//! Uses blocking queries: each request carries the last seen `X-Consul-Index`
//! and returns when membership changes or the wait elapses.

use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ServiceSpec;
use crate::dispatch::instancer::Instancer;
use crate::error::{GatewayError, GatewayResult};
use crate::types::InstanceAddress;

const CONSUL_INDEX_HEADER: &str = "X-Consul-Index";
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// Pause between queries whose index did not move.
const STALL_BACKOFF: Duration = Duration::from_millis(500);

/// Index for the next blocking query, and whether it failed to advance.
///
/// A missing index header reads as 0, which would turn the long poll into a
/// busy loop; indexes can also go backwards after an agent restart.
fn advance_index(previous: u64, reported: u64) -> (u64, bool) {
    let next = if reported < previous { 0 } else { reported };
    (next, next == 0 || next == previous)
}

/// One registered instance and whether all of its checks pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub address: InstanceAddress,
    pub passing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: HealthNode,
    service: HealthService,
    #[serde(default)]
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(default)]
    address: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthCheck {
    status: String,
}

/// Parse a `/v1/health/service/<name>` response body.
pub fn parse_health(body: &str) -> GatewayResult<Vec<ServiceInstance>> {
    let entries: Vec<HealthEntry> = serde_json::from_str(body)
        .map_err(|e| GatewayError::Transport(format!("unreadable registry response: {}", e)))?;

    Ok(entries
        .into_iter()
        .map(|entry| {
            // An empty service address means "same as the node".
            let host = if entry.service.address.is_empty() {
                entry.node.address
            } else {
                entry.service.address
            };
            ServiceInstance {
                address: InstanceAddress::new(format!("{}:{}", host, entry.service.port)),
                passing: entry.checks.iter().all(|c| c.status == "passing"),
            }
        })
        .collect())
}

/// Addresses admitted by `spec`'s health filter.
pub fn select_addresses(spec: &ServiceSpec, instances: Vec<ServiceInstance>) -> Vec<InstanceAddress> {
    instances
        .into_iter()
        .filter(|i| !spec.passing_only || i.passing)
        .map(|i| i.address)
        .collect()
}

/// Client for a Consul agent's health API.
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    client: reqwest::Client,
    base: Url,
    wait: Duration,
}

impl ConsulRegistry {
    pub fn new(base_url: &str, wait: Duration) -> anyhow::Result<Self> {
        let base = Url::parse(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(wait + Duration::from_secs(10))
            .build()?;
        Ok(Self { client, base, wait })
    }

    fn health_url(&self, spec: &ServiceSpec, index: u64) -> GatewayResult<Url> {
        let mut url = self
            .base
            .join(&format!("v1/health/service/{}", spec.name))
            .map_err(|e| GatewayError::Internal(format!("bad registry url: {}", e)))?;

        {
            let mut query = url.query_pairs_mut();
            if spec.passing_only {
                query.append_pair("passing", "true");
            }
            for tag in &spec.tags {
                query.append_pair("tag", tag);
            }
            if index > 0 {
                query.append_pair("index", &index.to_string());
                query.append_pair("wait", &format!("{}s", self.wait.as_secs()));
            }
        }
        Ok(url)
    }

    /// One (possibly blocking) health query. Returns the new index and the
    /// instances Consul reported.
    pub async fn fetch(
        &self,
        spec: &ServiceSpec,
        index: u64,
    ) -> GatewayResult<(u64, Vec<ServiceInstance>)> {
        let url = self.health_url(spec, index)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("registry unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(GatewayError::Transport(format!(
                "registry answered {}",
                response.status()
            )));
        }

        let new_index = response
            .headers()
            .get(CONSUL_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Transport(format!("registry body: {}", e)))?;

        Ok((new_index, parse_health(&body)?))
    }

    /// Keep `instancer` in sync with the registry until `shutdown` fires.
    ///
    /// Failures leave the last good snapshot in place.
    pub async fn watch(self, spec: ServiceSpec, instancer: Instancer, shutdown: CancellationToken) {
        info!(service = %spec.name, tags = ?spec.tags, "Watching registry");
        let mut index = 0u64;

        loop {
            let fetched = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.fetch(&spec, index) => res,
            };

            match fetched {
                Ok((new_index, instances)) => {
                    let (next, stalled) = advance_index(index, new_index);
                    index = next;
                    debug!(service = %spec.name, index, reported = instances.len(), "Registry update");
                    instancer.update(select_addresses(&spec, instances));

                    if stalled {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(STALL_BACKOFF) => {}
                        }
                    }
                }
                Err(e) => {
                    warn!(service = %spec.name, error = %e, "Registry query failed; keeping last instance set");
                    index = 0;
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!(service = %spec.name, "Registry watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEALTH_BODY: &str = r#"[
        {
            "Node": {"Node": "n1", "Address": "10.0.0.1"},
            "Service": {"ID": "user-1", "Service": "user", "Address": "", "Port": 9001, "Tags": []},
            "Checks": [{"CheckID": "serfHealth", "Status": "passing"}]
        },
        {
            "Node": {"Node": "n2", "Address": "10.0.0.2"},
            "Service": {"ID": "user-2", "Service": "user", "Address": "192.168.1.5", "Port": 9002, "Tags": []},
            "Checks": [
                {"CheckID": "serfHealth", "Status": "passing"},
                {"CheckID": "service:user-2", "Status": "critical"}
            ]
        }
    ]"#;

    #[test]
    fn test_parse_health_uses_node_address_fallback() {
        let instances = parse_health(HEALTH_BODY).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].address.as_str(), "10.0.0.1:9001");
        assert!(instances[0].passing);
        assert_eq!(instances[1].address.as_str(), "192.168.1.5:9002");
        assert!(!instances[1].passing);
    }

    #[test]
    fn test_select_addresses_filters_failing_when_passing_only() {
        let instances = parse_health(HEALTH_BODY).unwrap();

        let spec = ServiceSpec::new("user");
        assert_eq!(
            select_addresses(&spec, instances.clone()),
            vec![InstanceAddress::new("10.0.0.1:9001")]
        );

        let mut relaxed = ServiceSpec::new("user");
        relaxed.passing_only = false;
        assert_eq!(select_addresses(&relaxed, instances).len(), 2);
    }

    #[test]
    fn test_advance_index() {
        assert_eq!(advance_index(0, 12), (12, false));
        assert_eq!(advance_index(12, 15), (15, false));
        // No header on the response.
        assert_eq!(advance_index(0, 0), (0, true));
        assert_eq!(advance_index(12, 0), (0, true));
        // Blocking query ran out its wait unchanged.
        assert_eq!(advance_index(15, 15), (15, true));
        assert_eq!(advance_index(15, 3), (0, true));
    }

    #[test]
    fn test_parse_health_rejects_garbage() {
        assert!(matches!(
            parse_health("<html>"),
            Err(GatewayError::Transport(_))
        ));
    }

    #[test]
    fn test_health_url() {
        let registry = ConsulRegistry::new("http://127.0.0.1:8500", Duration::from_secs(30)).unwrap();
        let mut spec = ServiceSpec::new("support");
        spec.tags = vec!["v1".to_string()];

        let first = registry.health_url(&spec, 0).unwrap();
        assert_eq!(
            first.as_str(),
            "http://127.0.0.1:8500/v1/health/service/support?passing=true&tag=v1"
        );

        let blocking = registry.health_url(&spec, 42).unwrap();
        assert!(blocking.as_str().ends_with("&index=42&wait=30s"));
    }

    #[tokio::test]
    async fn test_watch_keeps_snapshot_when_registry_is_down() {
        // Nothing listens on port 9; every query fails.
        let registry = ConsulRegistry::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let instancer = Instancer::new("user".into());
        instancer.update(vec![InstanceAddress::new("10.0.0.1:9001")]);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(registry.watch(ServiceSpec::new("user"), instancer.clone(), shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(
            instancer.snapshot().addresses,
            vec![InstanceAddress::new("10.0.0.1:9001")]
        );
    }

    #[tokio::test]
    async fn test_watch_without_index_header_does_not_spin() {
        use axum::Router;
        use axum::routing::get;
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use crate::types::ServiceName;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1/health/service/user",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { HEALTH_BODY }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let registry =
            ConsulRegistry::new(&format!("http://{}", addr), Duration::from_secs(30)).unwrap();
        let instancer = Instancer::new(ServiceName::new("user"));
        let shutdown = CancellationToken::new();
        let watcher = tokio::spawn(registry.watch(
            ServiceSpec::new("user"),
            instancer.clone(),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(800)).await;
        shutdown.cancel();
        watcher.await.unwrap();

        assert_eq!(
            instancer.snapshot().addresses,
            vec![InstanceAddress::new("10.0.0.1:9001")]
        );
        let polled = hits.load(Ordering::SeqCst);
        assert!((1..=3).contains(&polled), "polled {} times", polled);
    }
}
