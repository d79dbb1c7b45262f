//! Exclusive-open gates.
//!
//! Each openable endpoint (the device itself and each log stream) owns an
//! [`OpenGate`]. Opening takes a [`GateGuard`]; dropping the guard closes the
//! endpoint again, on every exit path.
//!
//! The gate packs a generation counter and the open bit into one atomic word.
//! [`OpenGate::force_release`] bumps the generation, which revokes whichever
//! guard is outstanding: the stale guard can no longer pass
//! [`GateGuard::check`], and its eventual drop leaves the gate alone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::{RelayError, Result};

const OPEN_BIT: u64 = 1;

/// Single-session gate for one endpoint.
#[derive(Debug)]
pub struct OpenGate {
    name: &'static str,
    // generation << 1 | open
    state: AtomicU64,
}

impl OpenGate {
    /// Create a closed gate.
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: AtomicU64::new(0),
        })
    }

    /// Endpoint name used in errors and diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// True while a session holds the gate.
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) & OPEN_BIT != 0
    }

    /// Open the endpoint.
    ///
    /// # Errors
    /// `Busy` if another session holds it.
    pub fn try_acquire(self: &Arc<Self>) -> Result<GateGuard> {
        let current = self.state.load(Ordering::Acquire);
        if current & OPEN_BIT != 0 {
            return Err(RelayError::busy(format!("{} is already open", self.name)));
        }
        let generation = (current >> 1) + 1;
        let next = (generation << 1) | OPEN_BIT;
        self.state
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RelayError::busy(format!("{} is already open", self.name)))?;

        debug!(gate = self.name, generation, "Opened");
        Ok(GateGuard {
            gate: Arc::clone(self),
            generation,
        })
    }

    /// Administrative recovery: close the gate regardless of who holds it.
    ///
    /// Meant for an operator recovering from a client that died without
    /// closing. The outstanding guard (if any) is revoked; its owner gets
    /// `SessionRevoked` on the next checked operation.
    pub fn force_release(&self) {
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some(((s >> 1) + 1) << 1)
            })
            .unwrap_or_else(|s| s);
        let was_open = previous & OPEN_BIT != 0;
        error!(gate = self.name, was_open, "Open gate force-released");
    }
}

/// Proof of an open session. Closes the gate on drop.
#[derive(Debug)]
pub struct GateGuard {
    gate: Arc<OpenGate>,
    generation: u64,
}

impl GateGuard {
    /// True until the gate is force-released.
    pub fn is_current(&self) -> bool {
        self.gate.state.load(Ordering::Acquire) == (self.generation << 1) | OPEN_BIT
    }

    /// Fail with `SessionRevoked` if the gate was force-released.
    pub fn check(&self) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(RelayError::SessionRevoked(self.gate.name))
        }
    }

    /// The gate this guard was taken from.
    pub fn gate(&self) -> &Arc<OpenGate> {
        &self.gate
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let open = (self.generation << 1) | OPEN_BIT;
        let closed = self.generation << 1;
        // A revoked guard must not close a gate a newer session now holds
        if self
            .gate
            .state
            .compare_exchange(open, closed, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(gate = self.gate.name, generation = self.generation, "Closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_exclusive_open() {
        let gate = OpenGate::new("gih");
        let guard = gate.try_acquire().unwrap();
        assert!(gate.is_open());

        let err = gate.try_acquire().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        drop(guard);
        assert!(!gate.is_open());
        assert!(gate.try_acquire().is_ok());
    }

    #[test]
    fn test_force_release_revokes_stale_guard() {
        let gate = OpenGate::new("gih");
        let stale = gate.try_acquire().unwrap();
        assert!(stale.check().is_ok());

        gate.force_release();
        assert!(!gate.is_open());
        assert_eq!(stale.check().unwrap_err().kind(), ErrorKind::SessionRevoked);

        // A new session can open, and the stale drop must not close it
        let fresh = gate.try_acquire().unwrap();
        drop(stale);
        assert!(gate.is_open());
        assert!(fresh.check().is_ok());
    }

    #[test]
    fn test_force_release_on_closed_gate() {
        let gate = OpenGate::new("gihlog0");
        gate.force_release();
        assert!(!gate.is_open());
        assert!(gate.try_acquire().is_ok());
    }
}
