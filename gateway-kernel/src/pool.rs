//! Bounded execution pools keyed by (tier, pool key).

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use gateway_config::PoolConfig;
use gateway_primitives::{PoolKey, PoolTier};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Errors produced by the pool registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Registry is closed and will not admit new work.
    #[error("pools closed")]
    Closed,
    /// A tier was configured with a zero limit.
    #[error("pool limit for tier {0} must be greater than zero")]
    ZeroLimit(PoolTier),
}

/// Result alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Identity of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolId {
    tier: PoolTier,
    key: PoolKey,
}

impl PoolId {
    /// Creates an identifier.
    #[must_use]
    pub const fn new(tier: PoolTier, key: PoolKey) -> Self {
        Self { tier, key }
    }

    /// Returns the tier.
    #[must_use]
    pub const fn tier(&self) -> PoolTier {
        self.tier
    }

    /// Returns the pool key.
    #[must_use]
    pub const fn key(&self) -> &PoolKey {
        &self.key
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tier, self.key)
    }
}

/// Point-in-time occupancy of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Concurrency limit.
    pub limit: usize,
    /// Slots currently held.
    pub active: usize,
    /// Callers queued for a slot.
    pub waiting: usize,
}

#[derive(Debug)]
struct Pool {
    limit: usize,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
}

impl Pool {
    fn new(limit: NonZeroUsize) -> Self {
        Self {
            limit: limit.get(),
            semaphore: Arc::new(Semaphore::new(limit.get())),
            waiting: AtomicUsize::new(0),
        }
    }

    fn stats(&self) -> PoolStats {
        let available = if self.semaphore.is_closed() {
            self.limit
        } else {
            self.semaphore.available_permits()
        };
        PoolStats {
            limit: self.limit,
            active: self.limit.saturating_sub(available),
            waiting: self.waiting.load(Ordering::Acquire),
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Occupied slot in a pool. Dropping it frees the slot for the next waiter.
#[derive(Debug)]
pub struct PoolSlot {
    pool: PoolId,
    _permit: OwnedSemaphorePermit,
}

impl PoolSlot {
    /// Returns the pool the slot belongs to.
    #[must_use]
    pub const fn pool(&self) -> &PoolId {
        &self.pool
    }
}

/// Lazily created pools, one per (tier, key), each with the tier's limit.
///
/// Waiters are admitted strictly in arrival order.
#[derive(Debug)]
pub struct PoolRegistry {
    read_only: NonZeroUsize,
    local_write: NonZeroUsize,
    pools: Mutex<HashMap<PoolId, Arc<Pool>>>,
    closed: AtomicBool,
}

impl PoolRegistry {
    /// Creates a registry with explicit per-tier limits.
    #[must_use]
    pub fn new(read_only: NonZeroUsize, local_write: NonZeroUsize) -> Self {
        Self {
            read_only,
            local_write,
            pools: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a registry from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ZeroLimit`] when a tier has a zero limit.
    pub fn from_config(config: &PoolConfig) -> PoolResult<Self> {
        let read_only =
            NonZeroUsize::new(config.read_only).ok_or(PoolError::ZeroLimit(PoolTier::ReadOnly))?;
        let local_write = NonZeroUsize::new(config.local_write)
            .ok_or(PoolError::ZeroLimit(PoolTier::LocalWrite))?;
        Ok(Self::new(read_only, local_write))
    }

    /// Returns the limit applied to pools of `tier`.
    #[must_use]
    pub const fn limit(&self, tier: PoolTier) -> NonZeroUsize {
        match tier {
            PoolTier::ReadOnly => self.read_only,
            PoolTier::LocalWrite => self.local_write,
        }
    }

    /// Returns `true` once the registry has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn pool(&self, id: &PoolId) -> PoolResult<Arc<Pool>> {
        let mut pools = self.pools.lock();
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let pool = pools.entry(id.clone()).or_insert_with(|| {
            debug!(pool = %id, limit = self.limit(id.tier()).get(), "pool created");
            Arc::new(Pool::new(self.limit(id.tier())))
        });
        Ok(Arc::clone(pool))
    }

    /// Waits for a slot in the pool identified by `tier` and `key`.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the registry is closed before or while
    /// waiting.
    pub async fn acquire(&self, tier: PoolTier, key: &PoolKey) -> PoolResult<PoolSlot> {
        let id = PoolId::new(tier, key.clone());
        let pool = self.pool(&id)?;
        let permit = {
            let _waiting = WaitingGuard::enter(&pool.waiting);
            Arc::clone(&pool.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| PoolError::Closed)?
        };
        Ok(PoolSlot {
            pool: id,
            _permit: permit,
        })
    }

    /// Returns occupancy for an existing pool.
    #[must_use]
    pub fn stats(&self, tier: PoolTier, key: &PoolKey) -> Option<PoolStats> {
        let id = PoolId::new(tier, key.clone());
        self.pools.lock().get(&id).map(|pool| pool.stats())
    }

    /// Returns the number of pools created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    /// Returns `true` when no pool exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every pool. Queued waiters fail with [`PoolError::Closed`].
    pub fn close(&self) {
        let pools = self.pools.lock();
        self.closed.store(true, Ordering::Release);
        for pool in pools.values() {
            pool.semaphore.close();
        }
    }

    /// Drops every pool. Only meaningful after [`PoolRegistry::close`].
    pub fn clear(&self) {
        self.pools.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn registry(read_only: usize) -> Arc<PoolRegistry> {
        Arc::new(
            PoolRegistry::from_config(&PoolConfig {
                read_only,
                local_write: 1,
            })
            .unwrap(),
        )
    }

    fn key(raw: &str) -> PoolKey {
        PoolKey::new(raw).unwrap()
    }

    #[tokio::test]
    async fn respects_limit_and_reports_waiters() {
        let registry = registry(2);
        let tenant = key("tenant-a");
        let first = registry.acquire(PoolTier::ReadOnly, &tenant).await.unwrap();
        let _second = registry.acquire(PoolTier::ReadOnly, &tenant).await.unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            let tenant = tenant.clone();
            tokio::spawn(async move { registry.acquire(PoolTier::ReadOnly, &tenant).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            registry.stats(PoolTier::ReadOnly, &tenant),
            Some(PoolStats {
                limit: 2,
                active: 2,
                waiting: 1
            })
        );

        drop(first);
        let third = waiter.await.unwrap().unwrap();
        assert_eq!(third.pool().tier(), PoolTier::ReadOnly);
        assert_eq!(registry.stats(PoolTier::ReadOnly, &tenant).unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn tiers_and_keys_are_independent() {
        let registry = registry(1);
        let _a = registry.acquire(PoolTier::ReadOnly, &key("a")).await.unwrap();
        let _b = registry.acquire(PoolTier::ReadOnly, &key("b")).await.unwrap();
        let _w = registry.acquire(PoolTier::LocalWrite, &key("a")).await.unwrap();
        assert_eq!(registry.len(), 3);
        assert!(registry.stats(PoolTier::LocalWrite, &key("b")).is_none());
    }

    #[tokio::test]
    async fn waiters_are_admitted_in_order() {
        let registry = registry(1);
        let tenant = key("fifo");
        let held = registry.acquire(PoolTier::ReadOnly, &tenant).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..4 {
            let registry = Arc::clone(&registry);
            let tenant = tenant.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let slot = registry.acquire(PoolTier::ReadOnly, &tenant).await.unwrap();
                order.lock().push(index);
                tokio::time::sleep(Duration::from_millis(2)).await;
                drop(slot);
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn close_fails_waiters_and_new_callers() {
        let registry = registry(1);
        let tenant = key("closing");
        let _held = registry.acquire(PoolTier::ReadOnly, &tenant).await.unwrap();
        let waiter = {
            let registry = Arc::clone(&registry);
            let tenant = tenant.clone();
            tokio::spawn(async move { registry.acquire(PoolTier::ReadOnly, &tenant).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        registry.close();
        assert_eq!(waiter.await.unwrap().unwrap_err(), PoolError::Closed);
        assert_eq!(
            registry.acquire(PoolTier::ReadOnly, &tenant).await.unwrap_err(),
            PoolError::Closed
        );
    }

    #[test]
    fn zero_limit_is_rejected() {
        let err = PoolRegistry::from_config(&PoolConfig {
            read_only: 0,
            local_write: 1,
        })
        .unwrap_err();
        assert_eq!(err, PoolError::ZeroLimit(PoolTier::ReadOnly));
    }
}
