use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

type Watcher<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Observable holder of a single value.
///
/// Reads hand out the current `Arc` snapshot; writes build a new value and
/// swap the `Arc`, so concurrent observers never see a torn update. Watchers
/// are invoked after the swap, outside of every lock.
pub struct ObservableValue<T> {
    value: RwLock<Arc<T>>,
    watchers: Mutex<Vec<(u64, Watcher<T>)>>,
    next_watcher_id: AtomicU64,
}

impl<T: Send + Sync + 'static> ObservableValue<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: RwLock::new(Arc::new(initial)),
            watchers: Mutex::new(Vec::new()),
            next_watcher_id: AtomicU64::new(0),
        }
    }

    /// Current snapshot. Cheap; never blocks on writers for longer than the
    /// pointer swap.
    pub fn get(&self) -> Arc<T> {
        Arc::clone(
            &self
                .value
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn set(&self, value: T) {
        let next = Arc::new(value);
        {
            let mut guard = self
                .value
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = Arc::clone(&next);
        }
        self.notify(&next);
    }

    /// Compute the next value from the current one and swap it in. The write
    /// lock is held during `mutate`, serializing concurrent writers.
    pub fn update(&self, mutate: impl FnOnce(&T) -> T) {
        let next = {
            let mut guard = self
                .value
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let next = Arc::new(mutate(&guard));
            *guard = Arc::clone(&next);
            next
        };
        self.notify(&next);
    }

    /// Register a change watcher; returns an id accepted by `unwatch`.
    pub fn watch(&self, watcher: impl Fn(&T) + Send + Sync + 'static) -> u64 {
        let id = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        self.watchers_guard().push((id, Arc::new(watcher)));
        id
    }

    pub fn unwatch(&self, id: u64) {
        self.watchers_guard().retain(|(wid, _)| *wid != id);
    }

    fn notify(&self, value: &T) {
        let snapshot: Vec<Watcher<T>> = self
            .watchers_guard()
            .iter()
            .map(|(_, w)| Arc::clone(w))
            .collect();
        for watcher in snapshot {
            watcher(value);
        }
    }

    fn watchers_guard(&self) -> MutexGuard<'_, Vec<(u64, Watcher<T>)>> {
        self.watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
