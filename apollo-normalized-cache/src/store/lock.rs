use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::ThreadId;

use parking_lot::Mutex;
use parking_lot::RwLock;

static NEXT_LOCK_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Read transactions held by this thread, per lock.
    static READ_DEPTH: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

/// The reentrant read/write lock guarding a store.
///
/// Reads nest inside reads and writes. Writes nest inside writes. Opening a write while this
/// thread holds a read would deadlock, so it panics instead.
pub(crate) struct TransactionLock {
    id: usize,
    lock: RwLock<()>,
    writer: Mutex<Option<ThreadId>>,
}

impl TransactionLock {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            lock: RwLock::new(()),
            writer: Mutex::new(None),
        }
    }

    fn owns_write(&self) -> bool {
        *self.writer.lock() == Some(thread::current().id())
    }

    fn read_depth(&self) -> usize {
        READ_DEPTH.with(|depth| depth.borrow().get(&self.id).copied().unwrap_or_default())
    }

    fn adjust_read_depth(&self, enter: bool) {
        READ_DEPTH.with(|depth| {
            let mut depth = depth.borrow_mut();
            let count = depth.entry(self.id).or_default();
            if enter {
                *count += 1;
            } else {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    depth.remove(&self.id);
                }
            }
        });
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.owns_write() {
            return f();
        }
        // recursive so that a nested read never queues behind a waiting writer
        let _guard = self.lock.read_recursive();
        self.adjust_read_depth(true);
        let _depth = scopeguard::guard((), |_| self.adjust_read_depth(false));
        f()
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.owns_write() {
            return f();
        }
        assert_eq!(
            self.read_depth(),
            0,
            "a write transaction cannot be opened inside a read transaction"
        );
        let _guard = self.lock.write();
        *self.writer.lock() = Some(thread::current().id());
        let _owner = scopeguard::guard((), |_| *self.writer.lock() = None);
        f()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[test]
    fn transactions_nest() {
        let lock = TransactionLock::new();
        let value = lock.read(|| lock.read(|| 1));
        assert_eq!(value, 1);
        let value = lock.write(|| lock.read(|| lock.write(|| 2)));
        assert_eq!(value, 2);
        assert_eq!(lock.read_depth(), 0);
        assert!(!lock.owns_write());
    }

    #[test]
    fn escalation_panics_and_releases_the_lock() {
        let lock = TransactionLock::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lock.read(|| lock.write(|| ()))
        }));
        assert!(result.is_err());
        assert_eq!(lock.read_depth(), 0);
        // the lock is usable again
        lock.write(|| ());
    }

    #[test]
    fn writers_exclude_readers() {
        let lock = Arc::new(TransactionLock::new());
        let inside = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lock = lock.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        if i % 2 == 0 {
                            lock.write(|| {
                                assert!(!inside.swap(true, Ordering::SeqCst));
                                thread::yield_now();
                                inside.store(false, Ordering::SeqCst);
                            });
                        } else {
                            lock.read(|| assert!(!inside.load(Ordering::SeqCst)));
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
