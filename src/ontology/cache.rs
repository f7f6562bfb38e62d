//! Per-run load cache for specifications and shape sets.
//!
//! Many targets usually share one source graph. Each distinct file set is
//! loaded once; concurrent requests for the same key wait on the first load.
//! A failed load leaves the slot empty, so every target that needs it reports
//! the failure itself.

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::PipelineError;

pub struct LoadCache<T> {
    entries: Mutex<HashMap<Vec<String>, Arc<OnceCell<Arc<T>>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T> Default for LoadCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LoadCache<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get_or_load<F>(&self, key: Vec<String>, load: F) -> Result<Arc<T>, PipelineError>
    where
        F: FnOnce() -> Result<T, PipelineError>,
    {
        let cell = {
            let mut entries = self.entries.lock();
            entries.entry(key).or_default().clone()
        };
        if let Some(value) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(value.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        cell.get_or_try_init(|| load().map(Arc::new)).cloned()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.lock().values().filter(|c| c.get().is_some()).count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn loads_each_key_once() {
        let cache: LoadCache<String> = LoadCache::new();
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = cache
                .get_or_load(vec!["a.ttl".into()], || {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok("graph".to_string())
                })
                .unwrap();
            assert_eq!(value.as_str(), "graph");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 2);
    }

    #[test]
    fn failed_loads_are_retried() {
        let cache: LoadCache<u32> = LoadCache::new();
        let err = cache.get_or_load(vec!["x".into()], || Err(PipelineError::Internal("boom".into())));
        assert!(err.is_err());
        let ok = cache.get_or_load(vec!["x".into()], || Ok(7)).unwrap();
        assert_eq!(*ok, 7);
    }
}
