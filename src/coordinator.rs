use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::domain::CanonicalKey;
use crate::error::TaigaError;

/// Grants at most one in-flight fetch per canonical key within this process.
///
/// Callers for a key that is already held block on a condition variable until
/// the holder's [`Ticket`] is dropped, then re-read the index themselves.
#[derive(Debug, Default)]
pub struct FetchCoordinator {
    in_flight: Mutex<HashSet<CanonicalKey>>,
    released: Condvar,
}

impl FetchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other ticket for `key` exists, then take ownership.
    pub fn acquire(&self, key: &CanonicalKey) -> Ticket<'_> {
        let mut in_flight = self.lock();
        let mut waited = false;
        while in_flight.contains(key) {
            if !waited {
                debug!(key = %key, "waiting for in-flight fetch");
            }
            waited = true;
            in_flight = self
                .released
                .wait(in_flight)
                .unwrap_or_else(PoisonError::into_inner);
        }
        in_flight.insert(key.clone());
        Ticket {
            coordinator: self,
            key: key.clone(),
            waited,
        }
    }

    pub fn is_in_flight(&self, key: &CanonicalKey) -> bool {
        self.lock().contains(key)
    }

    fn release(&self, key: &CanonicalKey) {
        let mut in_flight = self.lock();
        in_flight.remove(key);
        self.released.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<CanonicalKey>> {
        // The set stays consistent even if a holder panicked.
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive right to move `key` out of the absent state. Released on drop,
/// so every exit path (including `?` and panics) frees the key.
#[derive(Debug)]
pub struct Ticket<'a> {
    coordinator: &'a FetchCoordinator,
    key: CanonicalKey,
    waited: bool,
}

impl Ticket<'_> {
    pub fn key(&self) -> &CanonicalKey {
        &self.key
    }

    /// True if another holder had the key when this ticket was requested.
    pub fn waited(&self) -> bool {
        self.waited
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.coordinator.release(&self.key);
    }
}

/// Cooperative cancellation flag shared by an `App` and its workers.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self, label: impl std::fmt::Display) -> Result<(), TaigaError> {
        if self.is_cancelled() {
            return Err(TaigaError::Interrupted(label.to_string()));
        }
        Ok(())
    }
}
