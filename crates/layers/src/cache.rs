//! Shared cache configuration and per-layer presence tables.
//!
//! Every cache-capable layer of a chain holds a clone of the same
//! [`CacheHandle`]. The handle carries the capacity (vocab ids below it are
//! cache candidates, `0` disables caching) and an epoch counter. Reconfiguring
//! or invalidating the handle bumps the epoch, and each layer's
//! [`CacheTable`] clears itself the next time it syncs, so the lookup layer's
//! "already emitted" view never drifts from the projection's "already cached"
//! view.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

#[derive(Debug, Default)]
struct CacheState {
    capacity: AtomicUsize,
    epoch: AtomicU64,
}

/// Cheaply clonable handle to the cache configuration shared by a layer chain.
#[derive(Debug, Clone, Default)]
pub struct CacheHandle {
    state: Arc<CacheState>,
}

impl CacheHandle {
    /// Creates a handle caching outputs for vocab ids `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        let handle = Self::default();
        handle.state.capacity.store(capacity, Ordering::Release);
        handle
    }

    /// A handle with caching turned off.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity() > 0
    }

    /// Whether `vocab_id` falls inside the cacheable id range.
    pub fn covers(&self, vocab_id: usize) -> bool {
        vocab_id < self.capacity()
    }

    pub fn epoch(&self) -> u64 {
        self.state.epoch.load(Ordering::Acquire)
    }

    /// Changes the capacity and clears every table synced to this handle.
    pub fn reconfigure(&self, capacity: usize) {
        self.state.capacity.store(capacity, Ordering::Release);
        self.invalidate();
        log::info!("decode cache reconfigured: capacity={}", capacity);
    }

    /// Drops all cached state without changing the capacity.
    pub fn invalidate(&self) {
        self.state.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether two handles refer to the same shared configuration.
    pub fn same_as(&self, other: &CacheHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// Monotonic presence flags for vocab ids `0..capacity`, tied to a handle epoch.
#[derive(Debug, Clone, Default)]
pub struct CacheTable {
    present: Vec<bool>,
    epoch: u64,
}

impl CacheTable {
    /// Brings the table in line with `handle`, clearing it when the handle was
    /// reconfigured or invalidated since the last sync. Returns `true` when
    /// the table was reset.
    pub fn sync(&mut self, handle: &CacheHandle) -> bool {
        let epoch = handle.epoch();
        let capacity = handle.capacity();
        if epoch == self.epoch && capacity == self.present.len() {
            return false;
        }
        self.epoch = epoch;
        self.present.clear();
        self.present.resize(capacity, false);
        true
    }

    pub fn capacity(&self) -> usize {
        self.present.len()
    }

    pub fn contains(&self, vocab_id: usize) -> bool {
        self.present.get(vocab_id).copied().unwrap_or(false)
    }

    /// Marks `vocab_id` present. Ids beyond the capacity are ignored.
    pub fn mark(&mut self, vocab_id: usize) {
        if let Some(slot) = self.present.get_mut(vocab_id) {
            *slot = true;
        }
    }

    /// Number of ids currently marked.
    pub fn len(&self) -> usize {
        self.present.iter().filter(|&&present| present).count()
    }

    pub fn is_empty(&self) -> bool {
        !self.present.iter().any(|&present| present)
    }
}

/// Running counters describing how a projection layer used its cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Rows served from the cache output matrix.
    pub hits: u64,
    /// Rows copied from an earlier row of the same batch.
    pub repeats: u64,
    /// Candidate rows that had to be computed.
    pub misses: u64,
    /// Rows that went through the kernel.
    pub computed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_follow_handle_capacity() {
        let handle = CacheHandle::new(4);
        let mut table = CacheTable::default();
        assert!(table.sync(&handle));
        assert_eq!(table.capacity(), 4);
        assert!(!table.sync(&handle));

        table.mark(2);
        table.mark(9);
        assert!(table.contains(2));
        assert!(!table.contains(9));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn invalidation_reaches_every_clone() {
        let handle = CacheHandle::new(3);
        let shared = handle.clone();
        let mut first = CacheTable::default();
        let mut second = CacheTable::default();
        first.sync(&handle);
        second.sync(&shared);
        first.mark(0);
        second.mark(1);

        shared.invalidate();
        assert!(first.sync(&handle));
        assert!(second.sync(&shared));
        assert!(first.is_empty() && second.is_empty());
        assert!(handle.same_as(&shared));
    }

    #[test]
    fn reconfigure_resizes_tables() {
        let handle = CacheHandle::new(2);
        let mut table = CacheTable::default();
        table.sync(&handle);
        table.mark(1);

        handle.reconfigure(8);
        assert!(table.sync(&handle));
        assert_eq!(table.capacity(), 8);
        assert!(!table.contains(1));

        handle.reconfigure(0);
        table.sync(&handle);
        assert!(!handle.is_enabled());
        assert_eq!(table.capacity(), 0);
    }
}
