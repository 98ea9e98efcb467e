//! Bounded slab allocation shared by every list in the routing core.
//!
//! A `tokio::sync::Semaphore` sized to the pool capacity turns "the slab is
//! full" into a bounded wait, so `alloc` can return `PoolExhausted` instead
//! of silently evicting a live route.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::Semaphore;

use crate::error::RoutingError;

/// A fixed-capacity slab of `T`, indices stable for the lifetime of the
/// allocation. Deletion is by index: no pointer recovery, just a `usize`
/// into a `Vec<Option<T>>`.
pub struct BoundedSlab<T> {
    records: Mutex<Vec<Option<T>>>,
    semaphore: Semaphore,
}

impl<T> BoundedSlab<T> {
    pub fn new(capacity: usize) -> Self {
        let mut records = Vec::with_capacity(capacity);
        records.resize_with(capacity, || None);
        Self { records: Mutex::new(records), semaphore: Semaphore::new(capacity) }
    }

    /// Reserve a slot and install `value`, waiting up to `timeout` for a
    /// free slot before failing with `PoolExhausted`.
    pub async fn alloc(&self, value: T, timeout: Duration) -> Result<usize, RoutingError> {
        let permit = tokio::time::timeout(timeout, self.semaphore.acquire())
            .await
            .map_err(|_| RoutingError::PoolExhausted)?
            .map_err(|_| RoutingError::PoolExhausted)?;
        // The permit is logically owned by the slot until `free` gives it back.
        permit.forget();

        let mut records = self.records.lock().await;
        let slot = records.iter().position(|slot| slot.is_none()).expect(
            "semaphore permit implies a free slot; pool size and semaphore capacity are kept in sync",
        );
        records[slot] = Some(value);
        Ok(slot)
    }

    /// Release slot `idx` back to the pool, returning its value if present.
    pub async fn free(&self, idx: usize) -> Option<T> {
        let mut records = self.records.lock().await;
        let taken = records.get_mut(idx).and_then(|slot| slot.take());
        if taken.is_some() {
            self.semaphore.add_permits(1);
        }
        taken
    }

    pub async fn get_cloned(&self, idx: usize) -> Option<T>
    where
        T: Clone,
    {
        let records = self.records.lock().await;
        records.get(idx).and_then(|slot| slot.clone())
    }

    pub async fn with_mut<R>(&self, idx: usize, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut records = self.records.lock().await;
        records.get_mut(idx).and_then(|slot| slot.as_mut()).map(f)
    }

    pub async fn snapshot_all(&self) -> Vec<(usize, T)>
    where
        T: Clone,
    {
        let records = self.records.lock().await;
        records
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.clone().map(|value| (idx, value)))
            .collect()
    }

    pub async fn live_count(&self) -> usize {
        self.records.lock().await.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn alloc_fails_when_exhausted() {
        let pool: BoundedSlab<u32> = BoundedSlab::new(1);
        let idx = pool.alloc(1, Duration::from_millis(50)).await.unwrap();
        let err = pool.alloc(2, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, RoutingError::PoolExhausted));
        pool.free(idx).await;
        assert!(pool.alloc(3, Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn free_returns_slot_for_reuse() {
        let pool: BoundedSlab<u32> = BoundedSlab::new(2);
        let a = pool.alloc(10, Duration::from_millis(50)).await.unwrap();
        let b = pool.alloc(20, Duration::from_millis(50)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.live_count().await, 2);
        pool.free(a).await;
        assert_eq!(pool.live_count().await, 1);
    }
}
