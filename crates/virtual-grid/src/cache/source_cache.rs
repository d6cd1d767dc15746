//! Reusable cache of opened source handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{GridError, Result};
use crate::source::DataSource;
use crate::types::CacheStats;

/// One slot per cataloged source.
#[derive(Default)]
struct Slot {
    handle: OnceLock<Arc<dyn DataSource>>,
    /// Serialises construction of this slot only.
    building: Mutex<()>,
}

/// Cache of built data-source handles, addressed by catalog index.
///
/// A slot is either empty or holds a built handle. Reads of built handles
/// take no lock; building a slot is guarded per slot so each source is opened
/// at most once even when loads from several threads interleave.
pub struct SourceCache {
    slots: Vec<Slot>,
    builds: AtomicU64,
    hits: AtomicU64,
}

impl SourceCache {
    /// Create an empty cache with one slot per source.
    pub fn new(num_sources: usize) -> Self {
        Self {
            slots: (0..num_sources).map(|_| Slot::default()).collect(),
            builds: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Return the handle in `index`, building it with `build` if the slot is empty.
    pub fn get_or_build<F>(&self, index: usize, build: F) -> Result<Arc<dyn DataSource>>
    where
        F: FnOnce() -> Result<Arc<dyn DataSource>>,
    {
        let slot = self.slots.get(index).ok_or_else(|| {
            GridError::validation(format!(
                "source cache has {} slots, no slot {}",
                self.slots.len(),
                index
            ))
        })?;

        if let Some(handle) = slot.handle.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(handle.clone());
        }

        let _guard = slot.building.lock();
        if let Some(handle) = slot.handle.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(handle.clone());
        }

        let handle = build()?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        let _ = slot.handle.set(handle.clone());
        Ok(handle)
    }

    /// Get an already-built handle without building.
    pub fn get(&self, index: usize) -> Option<Arc<dyn DataSource>> {
        self.slots.get(index).and_then(|slot| slot.handle.get().cloned())
    }

    /// Check if a slot holds a built handle.
    pub fn contains(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            builds: self.builds.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            entries: self.slots.iter().filter(|s| s.handle.get().is_some()).count(),
            slots: self.slots.len(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if the cache has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use std::sync::atomic::AtomicUsize;

    struct Constant {
        dims: Vec<String>,
        shape: Vec<usize>,
    }

    impl DataSource for Constant {
        fn dims(&self) -> &[String] {
            &self.dims
        }

        fn shape(&self) -> &[usize] {
            &self.shape
        }

        fn read(&self, indices: &[Vec<usize>]) -> Result<ArrayD<f64>> {
            Ok(ArrayD::from_elem(IxDyn(&[indices[0].len()]), 1.0))
        }
    }

    fn constant() -> Result<Arc<dyn DataSource>> {
        Ok(Arc::new(Constant {
            dims: vec!["time".to_string()],
            shape: vec![4],
        }))
    }

    #[test]
    fn test_get_or_build_builds_once() {
        let cache = SourceCache::new(2);
        let opens = AtomicUsize::new(0);

        for _ in 0..5 {
            cache
                .get_or_build(1, || {
                    opens.fetch_add(1, Ordering::SeqCst);
                    constant()
                })
                .unwrap();
        }

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(cache.contains(1));
        assert!(!cache.contains(0));

        let stats = cache.stats();
        assert_eq!(stats.builds, 1);
        assert_eq!(stats.hits, 4);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.slots, 2);
    }

    #[test]
    fn test_failed_build_leaves_slot_empty() {
        let cache = SourceCache::new(1);
        let err = cache.get_or_build(0, || Err(GridError::source_unreadable("s", "open", "boom")));
        assert!(err.is_err());
        assert!(!cache.contains(0));

        cache.get_or_build(0, constant).unwrap();
        assert!(cache.contains(0));
    }

    #[test]
    fn test_concurrent_builds_open_once() {
        let cache = SourceCache::new(1);
        let opens = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    cache
                        .get_or_build(0, || {
                            opens.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            constant()
                        })
                        .unwrap();
                });
            }
        });

        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_slot_is_validation_error() {
        let cache = SourceCache::new(1);
        let err = cache.get_or_build(3, constant).err().unwrap();
        assert!(matches!(err, GridError::Validation(_)));
    }
}
