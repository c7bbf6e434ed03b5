use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

struct Entry<T> {
    context: Arc<T>,
    ref_count: u32,
    finalizer: Box<dyn FnOnce(Arc<T>) + Send>,
}

/// A refcounted lookup table from `u64` id to a context value, grounded on
/// `original_source/code_root/cc/shared/refcounted_lookup.cc`.
///
/// Every entry starts at `ref_count = 1` when registered via [`new_id`].
/// [`addref_and_get`] increments the count and hands back the context;
/// [`deref`] decrements it by an arbitrary amount and, if that reaches
/// zero, removes the entry and invokes its finalizer. The finalizer is
/// always invoked *after* the table's internal lock has been released —
/// this differs from the original's `clean_all_contexts`, which runs every
/// finalizer while still holding the lock (see `DESIGN.md`); this crate
/// applies the release-before-finalize rule uniformly, including during
/// `clean_all`, so a finalizer can never re-enter the table while it is
/// locked.
pub struct HandleTable<T> {
    entries: Mutex<HashMap<u64, Entry<T>>>,
    seed: AtomicI64,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            seed: AtomicI64::new(-1),
        }
    }

    /// Registers `context` under a freshly allocated id with `ref_count =
    /// 1` and returns that id.
    pub fn new_id(&self, context: Arc<T>, finalizer: impl FnOnce(Arc<T>) + Send + 'static) -> u64 {
        let id = self.seed.fetch_add(1, Ordering::Relaxed) + 1;
        let id = id as u64;
        self.entries.lock().insert(
            id,
            Entry {
                context,
                ref_count: 1,
                finalizer: Box::new(finalizer),
            },
        );
        id
    }

    /// Increments the refcount for `id` and returns its context, or `None`
    /// if `id` is absent (already finalized, e.g. the request already
    /// timed out and was cleaned up).
    pub fn addref_and_get(&self, id: u64) -> Option<Arc<T>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&id)?;
        entry.ref_count += 1;
        Some(entry.context.clone())
    }

    /// Decrements the refcount for `id` by `count`. If this brings it to
    /// zero or below, the entry is removed and its finalizer is invoked
    /// after the lock is released.
    pub fn deref(&self, id: u64, count: u32) {
        let finished = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&id) {
                Some(entry) => {
                    entry.ref_count = entry.ref_count.saturating_sub(count);
                    if entry.ref_count == 0 {
                        entries.remove(&id)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(entry) = finished {
            (entry.finalizer)(entry.context);
        }
    }

    /// Finalizes every remaining entry, used at shutdown. Snapshots and
    /// clears the table under the lock, then runs finalizers with the lock
    /// released.
    pub fn clean_all(&self) {
        let drained: Vec<Entry<T>> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            (entry.finalizer)(entry.context);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn new_id_starts_at_zero() {
        let table: HandleTable<i32> = HandleTable::new();
        let id = table.new_id(Arc::new(1), |_| {});
        assert_eq!(id, 0);
    }

    #[test]
    fn deref_to_zero_runs_finalizer_after_unlock() {
        let table: HandleTable<i32> = HandleTable::new();
        let finalized = Arc::new(AtomicBool::new(false));
        let f2 = finalized.clone();
        let id = table.new_id(Arc::new(7), move |_| f2.store(true, Ordering::SeqCst));
        assert!(!finalized.load(Ordering::SeqCst));
        table.deref(id, 1);
        assert!(finalized.load(Ordering::SeqCst));
        assert!(table.is_empty());
    }

    #[test]
    fn addref_extends_lifetime() {
        let table: HandleTable<i32> = HandleTable::new();
        let finalized = Arc::new(AtomicBool::new(false));
        let f2 = finalized.clone();
        let id = table.new_id(Arc::new(7), move |_| f2.store(true, Ordering::SeqCst));
        let _held = table.addref_and_get(id).unwrap();
        table.deref(id, 1);
        assert!(!finalized.load(Ordering::SeqCst));
        table.deref(id, 1);
        assert!(finalized.load(Ordering::SeqCst));
    }

    #[test]
    fn addref_on_missing_id_returns_none() {
        let table: HandleTable<i32> = HandleTable::new();
        assert!(table.addref_and_get(42).is_none());
    }

    #[test]
    fn clean_all_finalizes_every_remaining_entry() {
        let table: HandleTable<i32> = HandleTable::new();
        let count = Arc::new(AtomicI64::new(0));
        for _ in 0..5 {
            let c = count.clone();
            table.new_id(Arc::new(0), move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        table.clean_all();
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert!(table.is_empty());
    }
}
