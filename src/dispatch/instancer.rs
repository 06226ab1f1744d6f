//! Live instance sets, one per logical service.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::types::{InstanceAddress, ServiceName};

/// Immutable view of a service's live instances.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InstanceSnapshot {
    /// Bumped on every membership change.
    pub version: u64,
    /// Sorted, de-duplicated addresses.
    pub addresses: Vec<InstanceAddress>,
}

/// Holder of the current [`InstanceSnapshot`] for one service.
///
/// Readers get either the old or the new set, never a mix. Clones share the
/// same snapshot.
#[derive(Debug, Clone)]
pub struct Instancer {
    service: ServiceName,
    current: Arc<ArcSwap<InstanceSnapshot>>,
}

impl Instancer {
    pub fn new(service: ServiceName) -> Self {
        Self {
            service,
            current: Arc::new(ArcSwap::from_pointee(InstanceSnapshot::default())),
        }
    }

    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    pub fn snapshot(&self) -> Arc<InstanceSnapshot> {
        self.current.load_full()
    }

    /// Replace the instance set. Returns `false` when membership is unchanged
    /// and the snapshot was left alone.
    pub fn update(&self, addresses: impl IntoIterator<Item = InstanceAddress>) -> bool {
        let mut addresses: Vec<InstanceAddress> = addresses.into_iter().collect();
        addresses.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        addresses.dedup();

        let mut changed = false;
        self.current.rcu(|old| {
            if old.addresses == addresses {
                changed = false;
                Arc::clone(old)
            } else {
                changed = true;
                Arc::new(InstanceSnapshot {
                    version: old.version + 1,
                    addresses: addresses.clone(),
                })
            }
        });

        if changed {
            info!(
                service = %self.service,
                instances = addresses.len(),
                "Instance set changed"
            );
        }
        changed
    }
}
