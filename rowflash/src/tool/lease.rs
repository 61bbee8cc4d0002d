//! Exclusive access to serial ports
//!
//! Only one tool invocation may hold a serial port at a time. A [PortLease]
//! is held for the whole invocation and releases the port when dropped, on
//! every exit path.

use std::{
    collections::HashSet,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use log::debug;

/// Set of serial ports currently in use
///
/// Cloning yields a handle to the same set, so the coordinator can hand
/// copies to its workers.
#[derive(Debug, Default, Clone)]
pub struct PortLocks {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl PortLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `port` is free, then claim it
    pub fn acquire(&self, port: &str) -> PortLease {
        let mut held = self.lock();
        while held.contains(port) {
            debug!("Waiting for {port} to be released");
            held = self
                .inner
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(port.to_owned());

        self.lease(port)
    }

    /// Claim `port` if nobody else holds it
    pub fn try_acquire(&self, port: &str) -> Option<PortLease> {
        let mut held = self.lock();
        if held.insert(port.to_owned()) {
            Some(self.lease(port))
        } else {
            None
        }
    }

    /// Whether `port` is currently claimed
    pub fn is_held(&self, port: &str) -> bool {
        self.lock().contains(port)
    }

    fn lease(&self, port: &str) -> PortLease {
        PortLease {
            locks: self.clone(),
            port: port.to_owned(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked.
        self.inner
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Claim on a single serial port, released on drop
#[derive(Debug)]
pub struct PortLease {
    locks: PortLocks,
    port: String,
}

impl PortLease {
    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.port);
        self.locks.inner.released.notify_all();
        debug!("Released {}", self.port);
    }
}
