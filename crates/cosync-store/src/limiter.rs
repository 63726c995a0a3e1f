//! Bound on concurrent storage writes.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, StoreError};

/// Limits the number of storage operations in flight.
///
/// Callers wait in [`ParallelOpsLimiter::acquire`] once the threshold is
/// reached; the slot is released when the permit is dropped.
#[derive(Debug, Clone)]
pub struct ParallelOpsLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ParallelOpsLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Closed)
    }

    /// Number of operations currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.limit - self.semaphore.available_permits()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waits_at_threshold() {
        let limiter = ParallelOpsLimiter::new(2);
        let a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.in_flight(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(20), limiter.acquire()).await;
        assert!(blocked.is_err());

        drop(a);
        let _c = tokio::time::timeout(Duration::from_millis(200), limiter.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(limiter.in_flight(), 2);
    }

    #[test]
    fn test_zero_limit_is_one() {
        assert_eq!(ParallelOpsLimiter::new(0).limit(), 1);
    }
}
