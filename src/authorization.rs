//! Transport authorization.
//!
//! Platforms that gate Bluetooth behind a runtime permission expose the
//! grant state through [`Authorization`]. Every connect, scan, enable and
//! read request consults it first and fails closed.

use std::sync::atomic::{AtomicBool, Ordering};

/// Answers whether the Bluetooth capability is currently granted.
pub trait Authorization: Send + Sync {
    /// Check if the capability is granted.
    fn is_granted(&self) -> bool;
}

/// Authorization that is always granted.
///
/// Desktop BLE stacks have no runtime permission model; this is the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Granted;

impl Authorization for Granted {
    fn is_granted(&self) -> bool {
        true
    }
}

/// Authorization backed by a flag the embedding application flips.
#[derive(Debug, Default)]
pub struct AuthorizationFlag {
    granted: AtomicBool,
}

impl AuthorizationFlag {
    /// Create a flag with the given initial state.
    pub fn new(granted: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
        }
    }

    /// Mark the capability as granted.
    pub fn grant(&self) {
        self.granted.store(true, Ordering::SeqCst);
    }

    /// Mark the capability as revoked.
    pub fn revoke(&self) {
        self.granted.store(false, Ordering::SeqCst);
    }
}

impl Authorization for AuthorizationFlag {
    fn is_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granted() {
        assert!(Granted.is_granted());
    }

    #[test]
    fn test_flag() {
        let flag = AuthorizationFlag::new(false);
        assert!(!flag.is_granted());
        flag.grant();
        assert!(flag.is_granted());
        flag.revoke();
        assert!(!flag.is_granted());
        assert!(!AuthorizationFlag::default().is_granted());
    }
}
