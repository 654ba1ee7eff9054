//! Serial-port exclusivity registry
//!
//! Serial device nodes are single-owner resources: two sessions opening the
//! same `/dev/ttyUSB0` corrupt each other's frames. The registry marks a
//! port busy on successful connect and frees it on disconnect or failed
//! connect. One registry instance lives in the core state and is shared by
//! every RTU transport in the process.

use dashmap::DashMap;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};

/// Tracks which serial ports are currently owned by a transport.
#[derive(Debug, Default)]
pub struct PortRegistry {
    busy: DashMap<String, ()>,
}

impl PortRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a port. Fails with [`GatewayError::BusyInProgress`] when
    /// another transport already holds it.
    pub fn acquire(&self, path: &str) -> GatewayResult<()> {
        use dashmap::mapref::entry::Entry;
        match self.busy.entry(path.to_string()) {
            Entry::Occupied(_) => Err(GatewayError::BusyInProgress {
                resource: path.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(());
                debug!("Serial port acquired: {path}");
                Ok(())
            }
        }
    }

    /// Release a port. Releasing an unowned port is a no-op.
    pub fn release(&self, path: &str) {
        if self.busy.remove(path).is_some() {
            debug!("Serial port released: {path}");
        }
    }

    /// True while some transport owns the port.
    pub fn is_busy(&self, path: &str) -> bool {
        self.busy.contains_key(path)
    }

    /// Number of ports currently held.
    pub fn held_count(&self) -> usize {
        self.busy.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release() {
        let registry = PortRegistry::new();
        assert!(!registry.is_busy("/dev/ttyUSB0"));

        registry.acquire("/dev/ttyUSB0").unwrap();
        assert!(registry.is_busy("/dev/ttyUSB0"));
        assert_eq!(registry.held_count(), 1);

        registry.release("/dev/ttyUSB0");
        assert!(!registry.is_busy("/dev/ttyUSB0"));
        assert_eq!(registry.held_count(), 0);
    }

    #[test]
    fn test_double_acquire_fails() {
        let registry = PortRegistry::new();
        registry.acquire("/dev/ttyS1").unwrap();

        let err = registry.acquire("/dev/ttyS1").unwrap_err();
        assert!(matches!(err, GatewayError::BusyInProgress { .. }));

        // The failed acquire must not have clobbered the owner.
        assert!(registry.is_busy("/dev/ttyS1"));
    }

    #[test]
    fn test_independent_ports() {
        let registry = PortRegistry::new();
        registry.acquire("/dev/ttyUSB0").unwrap();
        registry.acquire("/dev/ttyUSB1").unwrap();
        assert_eq!(registry.held_count(), 2);

        registry.release("/dev/ttyUSB0");
        assert!(registry.is_busy("/dev/ttyUSB1"));
    }

    #[test]
    fn test_release_unowned_is_noop() {
        let registry = PortRegistry::new();
        registry.release("/dev/never-acquired");
        assert_eq!(registry.held_count(), 0);
    }
}
