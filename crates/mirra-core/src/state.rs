//! Guarded state container.
//!
//! State lives behind an `Arc` so readers get cheap immutable snapshots. Writes
//! only happen inside [`StateCell::with_commit`], which raises the committing
//! flag for the duration of the write and restores the previous value on exit
//! (including on unwind). A write to a snapshot that is still held elsewhere
//! clones the state first, so outstanding snapshots never change.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct StateCell<S> {
    current: RwLock<Arc<S>>,
    committing: AtomicBool,
}

struct CommitGuard<'a> {
    flag: &'a AtomicBool,
    previous: bool,
}

impl<'a> CommitGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        let previous = flag.swap(true, Ordering::SeqCst);
        Self { flag, previous }
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.previous, Ordering::SeqCst);
    }
}

impl<S: Clone> StateCell<S> {
    pub fn new(state: S) -> Self {
        Self {
            current: RwLock::new(Arc::new(state)),
            committing: AtomicBool::new(false),
        }
    }

    /// Immutable snapshot of the current state.
    pub fn snapshot(&self) -> Arc<S> {
        Arc::clone(&self.current.read())
    }

    /// True while a mutation is being applied.
    pub fn is_committing(&self) -> bool {
        self.committing.load(Ordering::SeqCst)
    }

    /// Run `apply` against the state inside the committing window.
    pub fn with_commit<R>(&self, apply: impl FnOnce(&mut S) -> R) -> R {
        let _guard = CommitGuard::enter(&self.committing);
        let mut current = self.current.write();
        apply(Arc::make_mut(&mut current))
    }

    /// Swap in a whole new state.
    pub fn replace(&self, state: S) {
        let _guard = CommitGuard::enter(&self.committing);
        *self.current.write() = Arc::new(state);
    }

    /// Rebuild the container around a copy of the current state.
    pub fn rebuild(&self) {
        let state = S::clone(&self.snapshot());
        self.replace(state);
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for StateCell<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCell")
            .field("current", &*self.current.read())
            .field("committing", &self.committing.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Doc {
        a: i32,
    }

    #[test]
    fn test_snapshot_isolated_from_later_commits() {
        let cell = StateCell::new(Doc { a: 1 });
        let before = cell.snapshot();
        cell.with_commit(|doc| doc.a = 2);
        assert_eq!(before.a, 1);
        assert_eq!(cell.snapshot().a, 2);
    }

    #[test]
    fn test_committing_flag_scoped_to_write() {
        let cell = StateCell::new(Doc { a: 1 });
        assert!(!cell.is_committing());
        let inside = cell.with_commit(|_| true);
        assert!(inside);
        assert!(!cell.is_committing());
    }

    #[test]
    fn test_guard_restores_previous_value() {
        let flag = AtomicBool::new(false);
        {
            let _outer = CommitGuard::enter(&flag);
            {
                let _inner = CommitGuard::enter(&flag);
                assert!(flag.load(Ordering::SeqCst));
            }
            // the inner guard restores `true`, not `false`
            assert!(flag.load(Ordering::SeqCst));
        }
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_guard_restored_after_panicking_handler() {
        let cell = Arc::new(StateCell::new(Doc { a: 1 }));
        let cloned = Arc::clone(&cell);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            cloned.with_commit(|_| panic!("handler blew up"));
        }));
        assert!(result.is_err());
        assert!(!cell.is_committing());
    }

    #[test]
    fn test_replace_and_rebuild() {
        let cell = StateCell::new(Doc { a: 1 });
        cell.replace(Doc { a: 9 });
        assert_eq!(*cell.snapshot(), Doc { a: 9 });

        let before = cell.snapshot();
        cell.rebuild();
        assert_eq!(*cell.snapshot(), Doc { a: 9 });
        assert!(!Arc::ptr_eq(&before, &cell.snapshot()));
    }
}
