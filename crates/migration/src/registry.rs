//! Keyed wait-registry for signed headers.
//!
//! Migrations register interest in `(partition, height)` and get a oneshot
//! receiver; the per-partition header listener calls
//! [`HeaderRegistry::fulfill`] for every header it sees. Headers nobody is
//! waiting for yet are kept in a small per-partition cache so a late
//! registration resolves immediately.

use parking_lot::Mutex;
use shardrun_types::{BlockHeight, PartitionId, SignedHeader};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Default)]
struct RegistryInner {
    waiters: HashMap<(PartitionId, BlockHeight), Vec<oneshot::Sender<SignedHeader>>>,
    recent: HashMap<PartitionId, BTreeMap<BlockHeight, SignedHeader>>,
}

impl RegistryInner {
    /// Drop waits whose receiver is gone, and buckets left empty.
    fn prune_closed(&mut self) {
        self.waiters.retain(|_, waiters| {
            waiters.retain(|w| !w.is_closed());
            !waiters.is_empty()
        });
    }
}

/// Wait-registry mapping `(partition, height)` to pending header waits.
#[derive(Debug)]
pub struct HeaderRegistry {
    inner: Mutex<RegistryInner>,
    cache_per_partition: usize,
}

impl HeaderRegistry {
    /// Create a registry keeping up to `cache_per_partition` recent headers
    /// per partition.
    pub fn new(cache_per_partition: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            cache_per_partition,
        }
    }

    /// Register a wait for the signed header of `partition` at `height`.
    ///
    /// Resolves immediately if that header is cached.
    pub fn register(
        &self,
        partition: PartitionId,
        height: BlockHeight,
    ) -> oneshot::Receiver<SignedHeader> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();

        if let Some(header) = inner
            .recent
            .get(&partition)
            .and_then(|cache| cache.get(&height))
        {
            let _ = tx.send(header.clone());
            return rx;
        }

        inner.prune_closed();
        inner.waiters.entry((partition, height)).or_default().push(tx);
        trace!(partition = partition.0, height = height.0, "Registered header wait");
        rx
    }

    /// Deliver a signed header to everyone waiting on it and cache it.
    ///
    /// Returns the number of waits resolved.
    pub fn fulfill(&self, header: SignedHeader) -> usize {
        let key = (header.partition, header.height);
        let mut inner = self.inner.lock();

        let mut delivered = 0;
        if let Some(waiters) = inner.waiters.remove(&key) {
            for waiter in waiters {
                if waiter.send(header.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        inner.prune_closed();

        if self.cache_per_partition > 0 {
            let cache = inner.recent.entry(header.partition).or_default();
            cache.insert(header.height, header);
            while cache.len() > self.cache_per_partition {
                cache.pop_first();
            }
        }

        delivered
    }

    /// Number of `(partition, height)` buckets still held.
    ///
    /// Abandoned waits are dropped on the next `register` or `fulfill`.
    pub fn pending(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(partition: u64, height: u64) -> SignedHeader {
        SignedHeader {
            partition: PartitionId(partition),
            height: BlockHeight(height),
            blob: vec![height as u8],
        }
    }

    #[tokio::test]
    async fn test_register_then_fulfill() {
        let registry = HeaderRegistry::new(4);
        let rx = registry.register(PartitionId(2), BlockHeight(7));

        assert_eq!(registry.fulfill(header(2, 7)), 1);
        assert_eq!(rx.await.unwrap(), header(2, 7));
        assert_eq!(registry.pending(), 0);
    }

    #[tokio::test]
    async fn test_fulfill_before_register_uses_cache() {
        let registry = HeaderRegistry::new(4);
        assert_eq!(registry.fulfill(header(1, 3)), 0);

        let rx = registry.register(PartitionId(1), BlockHeight(3));
        assert_eq!(rx.await.unwrap(), header(1, 3));
    }

    #[tokio::test]
    async fn test_other_partition_or_height_does_not_resolve() {
        let registry = HeaderRegistry::new(4);
        let mut rx = registry.register(PartitionId(1), BlockHeight(3));

        registry.fulfill(header(2, 3));
        registry.fulfill(header(1, 4));
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.pending(), 1);
    }

    #[tokio::test]
    async fn test_cache_is_bounded() {
        let registry = HeaderRegistry::new(2);
        for h in 1..=3 {
            registry.fulfill(header(1, h));
        }

        let mut oldest = registry.register(PartitionId(1), BlockHeight(1));
        assert!(oldest.try_recv().is_err());
        let newest = registry.register(PartitionId(1), BlockHeight(3));
        assert_eq!(newest.await.unwrap().height, BlockHeight(3));
    }

    #[tokio::test]
    async fn test_multiple_waiters_same_height() {
        let registry = HeaderRegistry::new(0);
        let a = registry.register(PartitionId(1), BlockHeight(5));
        let b = registry.register(PartitionId(1), BlockHeight(5));
        drop(registry.register(PartitionId(1), BlockHeight(5)));

        assert_eq!(registry.fulfill(header(1, 5)), 2);
        assert!(a.await.is_ok());
        assert!(b.await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_waits_released_by_later_headers() {
        let registry = HeaderRegistry::new(0);
        for height in 1..=50 {
            drop(registry.register(PartitionId(1), BlockHeight(height)));
        }
        let live = registry.register(PartitionId(2), BlockHeight(9));
        assert_eq!(registry.pending(), 1);

        // Heights that never arrive leave nothing behind once any header lands.
        drop(registry.register(PartitionId(1), BlockHeight(100)));
        assert_eq!(registry.fulfill(header(3, 1)), 0);
        assert_eq!(registry.pending(), 1);

        drop(live);
        registry.fulfill(header(3, 2));
        assert_eq!(registry.pending(), 0);
    }
}
