//! Bounded pool of separation engine handles.
//!
//! Handles are cached per stem-count variant and shared. A counting semaphore
//! caps how many separations run at once; every engine call goes through an
//! [`EngineLease`] that holds one permit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::engine::{EngineError, EngineFactory, SeparationEngine};
use crate::jobs::StemCount;

/// Engine handles plus the concurrency budget they share.
pub struct EnginePool {
    factory: Arc<dyn EngineFactory>,
    handles: DashMap<StemCount, Arc<dyn SeparationEngine>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl EnginePool {
    pub fn new(factory: Arc<dyn EngineFactory>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            factory,
            handles: DashMap::new(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Permits not currently held by a lease.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Number of variants with a loaded handle.
    pub fn loaded_variants(&self) -> usize {
        self.handles.len()
    }

    /// Wait for a free slot and return a lease on the `stems` handle.
    pub async fn acquire(&self, stems: StemCount) -> Result<EngineLease, EngineError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Unavailable("engine pool is closed".to_string()))?;
        let engine = self.handle(stems).await?;

        debug!(stems = %stems, available = self.available(), "Engine slot acquired");
        Ok(EngineLease {
            engine,
            stems,
            _permit: permit,
        })
    }

    /// Load handles for `variants` ahead of the first job. Failures are logged.
    pub async fn prewarm(&self, variants: &[StemCount]) {
        for &stems in variants {
            match self.handle(stems).await {
                Ok(_) => info!(stems = %stems, "Engine pre-warmed"),
                Err(e) => warn!(stems = %stems, error = %e, "Failed to pre-warm engine"),
            }
        }
    }

    /// Refuse new leases. Outstanding leases run to completion.
    pub fn close(&self) {
        self.permits.close();
    }

    async fn handle(&self, stems: StemCount) -> Result<Arc<dyn SeparationEngine>, EngineError> {
        if let Some(engine) = self.handles.get(&stems) {
            return Ok(engine.value().clone());
        }

        let factory = self.factory.clone();
        let engine = tokio::task::spawn_blocking(move || factory.create(stems))
            .await
            .map_err(|e| EngineError::Crashed(e.to_string()))??;

        Ok(self.handles.entry(stems).or_insert(engine).value().clone())
    }
}

/// Exclusive right to run one separation. The slot is released when the
/// lease is dropped.
pub struct EngineLease {
    engine: Arc<dyn SeparationEngine>,
    stems: StemCount,
    _permit: OwnedSemaphorePermit,
}

impl EngineLease {
    pub fn stems(&self) -> StemCount {
        self.stems
    }

    pub async fn separate(&self, input: &Path) -> Result<PathBuf, EngineError> {
        self.engine.separate(input, self.stems).await
    }

    /// Where the engine writes output for `input`, when known in advance.
    pub fn output_dir_for(&self, input: &Path) -> Option<PathBuf> {
        self.engine.output_dir_for(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        created: AtomicUsize,
    }

    struct EchoEngine;

    #[async_trait::async_trait]
    impl SeparationEngine for EchoEngine {
        async fn separate(&self, input: &Path, _stems: StemCount) -> Result<PathBuf, EngineError> {
            Ok(input.with_extension(""))
        }
    }

    impl EngineFactory for CountingFactory {
        fn create(&self, _stems: StemCount) -> Result<Arc<dyn SeparationEngine>, EngineError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoEngine))
        }
    }

    fn pool(max: usize) -> (Arc<CountingFactory>, EnginePool) {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
        });
        let pool = EnginePool::new(factory.clone(), max);
        (factory, pool)
    }

    #[tokio::test]
    async fn test_handles_are_cached_per_variant() {
        let (factory, pool) = pool(2);
        pool.prewarm(&[StemCount::Two, StemCount::Four]).await;
        drop(pool.acquire(StemCount::Two).await.unwrap());
        drop(pool.acquire(StemCount::Five).await.unwrap());

        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.loaded_variants(), 3);
    }

    #[tokio::test]
    async fn test_lease_holds_permit_until_dropped() {
        let (_, pool) = pool(1);
        let lease = pool.acquire(StemCount::Two).await.unwrap();
        assert_eq!(pool.available(), 0);

        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            pool.acquire(StemCount::Two),
        )
        .await;
        assert!(waiting.is_err());

        let out = lease.separate(Path::new("/uploads/a.mp3")).await.unwrap();
        assert_eq!(out, PathBuf::from("/uploads/a"));
        assert_eq!(pool.available(), 0);

        drop(lease);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_leases() {
        let (_, pool) = pool(1);
        pool.close();
        assert!(matches!(
            pool.acquire(StemCount::Two).await,
            Err(EngineError::Unavailable(_))
        ));
    }

    #[test]
    fn test_zero_limit_is_raised_to_one() {
        let (_, pool) = pool(0);
        assert_eq!(pool.max_concurrent(), 1);
    }
}
