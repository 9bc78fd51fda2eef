//! Bookkeeping of the local ports handed out to connections spawned by
//! `accept`.

use lazy_static::lazy_static;
use log::trace;
use rand::{self, Rng};
use std::{
    collections::HashSet,
    io::{self, ErrorKind},
    ops::Range,
    sync::{Arc, Mutex, MutexGuard},
};

/// The range ephemeral ports are drawn from.
pub const EPHEMERAL_PORTS: Range<u16> = 10_000..40_000;

/// How many random picks `allocate` makes before giving up.
const MAX_ALLOCATION_ATTEMPTS: usize = 64;

lazy_static! {
    static ref SHARED: Arc<PortRegistry> = Arc::new(PortRegistry::new());
}

/// A registry of locally used ports.
///
/// Every check-and-insert happens under one lock, so concurrent `accept`
/// calls on different listeners never hand out the same port twice.
#[derive(Debug, Default)]
pub struct PortRegistry {
    in_use: Mutex<HashSet<u16>>,
}

/// A port reserved in a [`PortRegistry`].
///
/// The port is released when the lease is dropped.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    registry: Arc<PortRegistry>,
}

impl PortRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the process-wide registry.
    pub fn shared() -> Arc<PortRegistry> {
        SHARED.clone()
    }

    /// Reserves a random free port from [`EPHEMERAL_PORTS`].
    pub fn allocate(self: &Arc<Self>) -> io::Result<PortLease> {
        let mut rng = rand::thread_rng();

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let port = rng.gen_range(EPHEMERAL_PORTS.start, EPHEMERAL_PORTS.end);
            if let Some(lease) = self.reserve(port) {
                return Ok(lease);
            }

            trace!("ephemeral port {} is taken, picking another one", port);
        }

        Err(io::Error::new(
            ErrorKind::AddrInUse,
            "no free ephemeral port found",
        ))
    }

    /// Reserves the given port, unless it is already in use.
    pub fn reserve(self: &Arc<Self>, port: u16) -> Option<PortLease> {
        if !self.lock().insert(port) {
            return None;
        }

        Some(PortLease {
            port,
            registry: self.clone(),
        })
    }

    /// Checks whether the port is currently reserved.
    pub fn is_in_use(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// The number of reserved ports.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Checks whether no port is reserved.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn release(&self, port: u16) {
        self.lock().remove(&port);
    }

    fn lock(&self) -> MutexGuard<HashSet<u16>> {
        // The set stays consistent even if a holder panicked, every
        // operation on it is a single call.
        match self.in_use.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl PortLease {
    /// Gets the reserved port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        trace!("releasing port {}", self.port);
        self.registry.release(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn allocate_in_range() {
        let registry = Arc::new(PortRegistry::new());
        let lease = registry.allocate().unwrap();

        assert!(EPHEMERAL_PORTS.contains(&lease.port()));
        assert!(registry.is_in_use(lease.port()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn reserve_twice() {
        let registry = Arc::new(PortRegistry::new());

        let lease = registry.reserve(12_000).unwrap();
        assert!(registry.reserve(12_000).is_none());

        drop(lease);
        assert!(registry.reserve(12_000).is_some());
    }

    #[test]
    fn drop_releases() {
        let registry = Arc::new(PortRegistry::new());
        let port = {
            let lease = registry.allocate().unwrap();
            lease.port()
        };

        assert!(!registry.is_in_use(port));
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        let registry = Arc::new(PortRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    (0..50)
                        .map(|_| registry.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let leases: Vec<PortLease> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<u16> = leases.iter().map(|l| l.port()).collect();

        assert_eq!(unique.len(), 400);
        assert_eq!(registry.len(), 400);
    }

    #[test]
    fn shared_is_shared() {
        assert!(Arc::ptr_eq(&PortRegistry::shared(), &PortRegistry::shared()));
    }
}
