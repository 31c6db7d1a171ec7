//! A thread-safe cell holding the currently published snapshot. [`SnapshotStore`] provides
//! concurrent access for readers (flag evaluation) and a single writer at a time (sync workers).
use std::sync::{Arc, Mutex, RwLock};

/// Snapshots are immutable once published and can only be replaced completely. Readers clone the
/// `Arc` and never observe a partially-applied update.
#[derive(Debug)]
pub(crate) struct SnapshotStore<T> {
    current: RwLock<Arc<T>>,
    /// Serializes read-modify-write cycles so that concurrent writers don't lose updates.
    writer: Mutex<()>,
}

impl<T: Clone> SnapshotStore<T> {
    pub fn new(initial: T) -> Self {
        SnapshotStore {
            current: RwLock::new(Arc::new(initial)),
            writer: Mutex::new(()),
        }
    }

    /// Get the currently published snapshot.
    pub fn get(&self) -> Arc<T> {
        // read() fails only if the lock is poisoned (a writer panicked while holding it), which
        // should never happen as the critical section is a pointer swap.
        self.current
            .read()
            .expect("thread holding snapshot lock should not panic")
            .clone()
    }

    /// Build the next snapshot from a copy of the current one and publish it.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _writer = self
            .writer
            .lock()
            .expect("thread holding snapshot writer lock should not panic");

        let mut next = T::clone(&self.get());
        let result = f(&mut next);
        self.publish(next);
        result
    }

    /// Publish `snapshot`, discarding the current one.
    pub fn replace(&self, snapshot: T) {
        let _writer = self
            .writer
            .lock()
            .expect("thread holding snapshot writer lock should not panic");
        self.publish(snapshot);
    }

    fn publish(&self, snapshot: T) {
        let mut slot = self
            .current
            .write()
            .expect("thread holding snapshot lock should not panic");
        *slot = Arc::new(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use super::SnapshotStore;

    #[test]
    fn can_update_from_another_thread() {
        let store = Arc::new(SnapshotStore::new(0u64));

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || store.update(|v| *v = 42)).join();
        }

        assert_eq!(*store.get(), 42);
    }

    #[test]
    fn published_snapshots_are_not_mutated() {
        let store = SnapshotStore::new(HashMap::from([("a", 1)]));
        let before = store.get();
        store.update(|m| {
            m.insert("b", 2);
        });
        assert_eq!(before.len(), 1);
        assert_eq!(store.get().len(), 2);
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let store = Arc::new(SnapshotStore::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        store.update(|v| *v += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*store.get(), 800);
    }
}
