//! Renewable wake lock.
//!
//! A lock acquired with a lease lapses on its own unless renewed, so a
//! supervisor that dies without releasing cannot pin the host awake
//! forever.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

/// Keeps the host from sleeping while workflows are running.
pub trait WakeLock: Send + Sync {
    /// Acquire or extend the lock for `lease`.
    fn acquire(&self, lease: Duration);

    fn release(&self);

    /// Whether an unexpired lease is held.
    fn is_held(&self) -> bool;
}

/// In-process lease. Tracks expiry against the tokio clock.
#[derive(Default)]
pub struct LeasedWakeLock {
    expires_at: Mutex<Option<Instant>>,
}

impl LeasedWakeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time left on the current lease.
    pub fn remaining(&self) -> Option<Duration> {
        let expires_at = (*self.expires_at.lock().unwrap_or_else(|e| e.into_inner()))?;
        expires_at.checked_duration_since(Instant::now())
    }
}

impl WakeLock for LeasedWakeLock {
    fn acquire(&self, lease: Duration) {
        let mut expires_at = self.expires_at.lock().unwrap_or_else(|e| e.into_inner());
        let renewed = expires_at.is_some_and(|at| at > Instant::now());
        *expires_at = Some(Instant::now() + lease);
        if renewed {
            debug!(lease_secs = lease.as_secs(), "Wake lock renewed");
        } else {
            info!(lease_secs = lease.as_secs(), "Wake lock acquired");
        }
    }

    fn release(&self) {
        if self
            .expires_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
        {
            info!("Wake lock released");
        }
    }

    fn is_held(&self) -> bool {
        self.remaining().is_some_and(|left| !left.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn lease_expires_without_renewal() {
        let lock = LeasedWakeLock::new();
        assert!(!lock.is_held());

        lock.acquire(Duration::from_secs(10));
        assert!(lock.is_held());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!lock.is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_extends_from_now() {
        let lock = LeasedWakeLock::new();
        lock.acquire(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;
        lock.acquire(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(lock.is_held());
        assert_eq!(lock.remaining(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn release_drops_the_lease() {
        let lock = LeasedWakeLock::new();
        lock.acquire(Duration::from_secs(60));
        lock.release();
        assert!(!lock.is_held());
        // Releasing twice is harmless.
        lock.release();
    }
}
