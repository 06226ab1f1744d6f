//! Per-service cache of instance clients with round-robin selection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::DispatcherConfig;
use crate::dispatch::instancer::Instancer;
use crate::rpc::RpcClient;
use crate::types::InstanceAddress;

#[derive(Default)]
struct Cache {
    version: Option<u64>,
    clients: Vec<Arc<RpcClient>>,
}

/// Turns an [`Instancer`]'s snapshot into ready-to-use clients.
///
/// Clients are rebuilt only when membership changes or when a client has sat
/// idle past the configured timeout. Departed instances are dropped from the
/// cache; calls already holding them finish normally.
pub struct Endpointer {
    instancer: Instancer,
    config: Arc<DispatcherConfig>,
    cache: Mutex<Cache>,
    cursor: AtomicUsize,
}

impl Endpointer {
    pub fn new(instancer: Instancer, config: Arc<DispatcherConfig>) -> Self {
        Self {
            instancer,
            config,
            cache: Mutex::new(Cache::default()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn instancer(&self) -> &Instancer {
        &self.instancer
    }

    /// Clients for the current snapshot, in snapshot order.
    pub fn endpoints(&self) -> Vec<Arc<RpcClient>> {
        let snapshot = self.instancer.snapshot();
        let idle_timeout = self.config.idle_timeout();
        let mut cache = self.cache.lock();

        let stale = cache.version != Some(snapshot.version)
            || cache.clients.iter().any(|c| c.idle_for() > idle_timeout);

        if stale {
            let mut previous: HashMap<InstanceAddress, Arc<RpcClient>> = cache
                .clients
                .drain(..)
                .map(|c| (c.address().clone(), c))
                .collect();

            let mut clients = Vec::with_capacity(snapshot.addresses.len());
            for address in &snapshot.addresses {
                match previous.remove(address) {
                    Some(client) if client.idle_for() <= idle_timeout => clients.push(client),
                    _ => match RpcClient::connect_lazy(address.clone(), &self.config) {
                        Ok(client) => {
                            debug!(service = %self.instancer.service(), instance = %address, "Built instance client");
                            clients.push(Arc::new(client));
                        }
                        Err(e) => {
                            warn!(service = %self.instancer.service(), instance = %address, error = %e, "Skipping instance");
                        }
                    },
                }
            }

            cache.version = Some(snapshot.version);
            cache.clients = clients;
        }

        cache.clients.clone()
    }

    /// Next client in round-robin order, or `None` when no instance is live.
    pub fn next(&self) -> Option<Arc<RpcClient>> {
        let endpoints = self.endpoints();
        if endpoints.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        Some(endpoints[idx].clone())
    }
}
