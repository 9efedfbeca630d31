use crate::core::{DbError, ResourceId, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Exclusive row locks, one per resource.
///
/// Each resource gets its own async mutex, so waiting on one row never
/// blocks work on another. A slot exists only while some transaction holds
/// or waits for it; the last guard to release an uncontended slot removes it.
#[derive(Default)]
pub struct RowLockManager {
    slots: Arc<SlotMap>,
}

type SlotMap = Mutex<HashMap<ResourceId, Arc<AsyncMutex<()>>>>;

impl RowLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, resource: ResourceId) -> Result<Arc<AsyncMutex<()>>> {
        let mut slots = self.slots.lock()?;
        Ok(Arc::clone(slots.entry(resource).or_default()))
    }

    /// Wait for the exclusive lock on `resource`.
    ///
    /// With `timeout == None` this waits indefinitely. Dropping the returned
    /// future before it resolves abandons the wait without acquiring anything.
    pub async fn acquire(
        &self,
        resource: ResourceId,
        timeout: Option<Duration>,
    ) -> Result<RowLockGuard> {
        let slot = self.slot(resource)?;
        let started = Instant::now();

        let guard = match timeout {
            Some(limit) => tokio::time::timeout(limit, slot.lock_owned())
                .await
                .map_err(|_| DbError::LockTimeout {
                    resource,
                    waited: started.elapsed(),
                })?,
            None => slot.lock_owned().await,
        };

        Ok(RowLockGuard {
            resource,
            waited: started.elapsed(),
            acquired_at: Instant::now(),
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
        })
    }

    /// Number of resources with a live lock slot
    pub fn slot_count(&self) -> Result<usize> {
        Ok(self.slots.lock()?.len())
    }

    /// Whether some transaction currently holds the lock on `resource`
    pub fn is_locked(&self, resource: ResourceId) -> Result<bool> {
        let slots = self.slots.lock()?;
        Ok(slots
            .get(&resource)
            .is_some_and(|slot| slot.try_lock().is_err()))
    }
}

/// Proof that the holder owns the exclusive lock on one row.
///
/// The lock is released when the guard is dropped.
pub struct RowLockGuard {
    resource: ResourceId,
    waited: Duration,
    acquired_at: Instant,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<SlotMap>,
}

impl RowLockGuard {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Time spent blocked before the lock was granted
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for RowLockGuard {
    fn drop(&mut self) {
        // Unlock first: an idle slot is then owned by the map alone.
        drop(self.guard.take());

        if let Ok(mut slots) = self.slots.lock() {
            let idle = slots
                .get(&self.resource)
                .is_some_and(|slot| Arc::strong_count(slot) == 1);
            if idle {
                slots.remove(&self.resource);
            }
        }
    }
}

impl std::fmt::Debug for RowLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowLockGuard")
            .field("resource", &self.resource)
            .field("waited", &self.waited)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_per_resource() {
        let locks = RowLockManager::new();
        let guard = locks.acquire(ResourceId(1), None).await.unwrap();

        let second = locks
            .acquire(ResourceId(1), Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(second, Err(DbError::LockTimeout { .. })));

        drop(guard);
        assert!(locks.acquire(ResourceId(1), Some(Duration::from_millis(20))).await.is_ok());
    }

    #[tokio::test]
    async fn test_different_resources_do_not_block() {
        let locks = RowLockManager::new();
        let _a = locks.acquire(ResourceId(1), None).await.unwrap();
        let b = locks
            .acquire(ResourceId(2), Some(Duration::from_millis(20)))
            .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_wait_acquires_nothing() {
        let locks = Arc::new(RowLockManager::new());
        let holder = locks.acquire(ResourceId(5), None).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire(ResourceId(5), None).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        drop(holder);
        assert!(!locks.is_locked(ResourceId(5)).unwrap());
        assert_eq!(locks.slot_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_slot_outlives_holder_while_contended() {
        let locks = Arc::new(RowLockManager::new());
        let holder = locks.acquire(ResourceId(3), None).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let guard = locks.acquire(ResourceId(3), None).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(guard);
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(locks.slot_count().unwrap(), 1);

        drop(holder);
        // Still queued on, so the slot stays until the waiter is done
        assert_eq!(locks.slot_count().unwrap(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.slot_count().unwrap(), 0);
    }
}
