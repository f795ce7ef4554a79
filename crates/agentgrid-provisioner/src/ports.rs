//! Host port allocation for tenant containers.
//!
//! The in-memory set is a cache of the durable port ledger. It must be
//! hydrated with [`PortAllocator::load_allocated_ports`] before the first
//! allocation in a process.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::ProvisionResult;
use crate::store::TenantStore;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("no available ports in range {start}-{end}")]
pub struct PortsExhausted {
    pub start: u16,
    pub end: u16,
}

/// Lowest-free-port allocator over a fixed inclusive range.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    /// Mark the lowest free port as occupied and return it.
    pub fn allocate(&self) -> Result<u16, PortsExhausted> {
        let mut allocated = self.lock();
        let port = self
            .range
            .clone()
            .find(|p| !allocated.contains(p))
            .ok_or(PortsExhausted {
                start: *self.range.start(),
                end: *self.range.end(),
            })?;
        allocated.insert(port);
        debug!(port, in_use = allocated.len(), "port allocated");
        Ok(port)
    }

    /// Free a port. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) {
        if self.lock().remove(&port) {
            debug!(port, "port released");
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Occupied ports, ascending.
    pub fn allocated(&self) -> Vec<u16> {
        self.lock().iter().copied().collect()
    }

    /// Mark every in-range port from the durable ledger as occupied.
    /// Returns how many ports were loaded.
    pub fn load_allocated_ports<S>(&self, source: &S) -> ProvisionResult<usize>
    where
        S: TenantStore + ?Sized,
    {
        let ports = source.list_allocated_ports()?;
        let mut allocated = self.lock();
        let mut loaded = 0;
        for port in ports {
            if !self.range.contains(&port) {
                warn!(port, "ledger port outside configured range, ignoring");
                continue;
            }
            allocated.insert(port);
            loaded += 1;
        }
        info!(
            loaded,
            start = *self.range.start(),
            end = *self.range.end(),
            "port allocator hydrated"
        );
        Ok(loaded)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.allocated.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use agentgrid_state::StateStore;

    use super::*;

    #[test]
    fn allocates_lowest_free_port() {
        let ports = PortAllocator::new(30000..=30005);
        assert_eq!(ports.allocate().unwrap(), 30000);
        assert_eq!(ports.allocate().unwrap(), 30001);
        assert_eq!(ports.allocate().unwrap(), 30002);

        ports.release(30001);
        assert_eq!(ports.allocate().unwrap(), 30001);
    }

    #[test]
    fn fills_gaps_first() {
        let store = StateStore::open_in_memory().unwrap();
        store.record_port_allocation(30000, "a").unwrap();
        store.record_port_allocation(30002, "b").unwrap();

        let ports = PortAllocator::new(30000..=30005);
        assert_eq!(ports.load_allocated_ports(&store).unwrap(), 2);
        assert_eq!(ports.allocate().unwrap(), 30001);
        assert_eq!(ports.allocate().unwrap(), 30003);
    }

    #[test]
    fn exhaustion_then_release_recovers() {
        let ports = PortAllocator::new(30000..=30002);
        for _ in 0..3 {
            ports.allocate().unwrap();
        }
        assert_eq!(
            ports.allocate().unwrap_err(),
            PortsExhausted {
                start: 30000,
                end: 30002
            }
        );

        ports.release(30001);
        assert_eq!(ports.allocate().unwrap(), 30001);
    }

    #[test]
    fn release_is_idempotent() {
        let ports = PortAllocator::new(30000..=30001);
        let port = ports.allocate().unwrap();
        ports.release(port);
        ports.release(port);
        ports.release(31000);
        assert!(ports.allocated().is_empty());
    }

    #[test]
    fn hydration_ignores_out_of_range_ports() {
        let store = StateStore::open_in_memory().unwrap();
        store.record_port_allocation(29999, "a").unwrap();
        store.record_port_allocation(30001, "b").unwrap();

        let ports = PortAllocator::new(30000..=30005);
        assert_eq!(ports.load_allocated_ports(&store).unwrap(), 1);
        assert_eq!(ports.allocated(), vec![30001]);
    }

    #[test]
    fn interleaved_allocations_never_duplicate_live_ports() {
        let ports = PortAllocator::new(30000..=30009);
        let mut live: HashSet<u16> = HashSet::new();

        for round in 0..200u32 {
            if round % 3 == 2 && !live.is_empty() {
                let victim = *live.iter().min().unwrap();
                live.remove(&victim);
                ports.release(victim);
            } else if let Ok(port) = ports.allocate() {
                assert!(live.insert(port), "port {port} handed out twice");
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_allocation_yields_distinct_ports() {
        let ports = Arc::new(PortAllocator::new(30000..=30049));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let ports = ports.clone();
                tokio::spawn(async move { ports.allocate() })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            let port = handle.await.unwrap().unwrap();
            assert!(seen.insert(port), "duplicate port {port}");
        }
        assert_eq!(seen.len(), 50);
        assert!(ports.allocate().is_err());
    }
}
