//! Change notifications for synchronized collections.
//!
//! Every structural change applied to a collection's local mirror produces
//! one [`Change`]. The [`Notifier`] fans it out to observers:
//!
//! ```text
//! mirror mutation
//!       │
//!       ▼
//! length cache refreshed      (built-in, always first)
//!       │
//!       ▼
//! observer N … observer 1     (most recently registered first)
//! ```
//!
//! Observers run with no internal lock held, so they may read the
//! collection, register further observers or issue mutations. Each one is
//! handed the length after the change, so it needs no handle of its own:
//! an observer that captures a handle of the collection it observes keeps
//! that collection, and its notification task, alive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// Observer callback: the change and the collection length after it.
pub type Observer = Arc<dyn Fn(&Change, usize) + Send + Sync>;

/// Tag of a [`Change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Synchronized,
    Reset,
    Inserted,
    Removed,
    Updated,
    Pushed,
    Unshifted,
    Popped,
    Shifted,
    Spliced,
}

impl ChangeKind {
    /// Tag as seen by view code.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Synchronized => "synchronized",
            ChangeKind::Reset => "reset",
            ChangeKind::Inserted => "inserted",
            ChangeKind::Removed => "removed",
            ChangeKind::Updated => "updated",
            ChangeKind::Pushed => "push",
            ChangeKind::Unshifted => "unshift",
            ChangeKind::Popped => "pop",
            ChangeKind::Shifted => "shift",
            ChangeKind::Spliced => "spliced",
        }
    }
}

/// A change applied to the local mirror.
///
/// The first four kinds come from the document backend (plus
/// `Synchronized`, shared by both); the positional kinds come from the
/// list backend, which replays the list operation the server performed.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Initial retrieval completed. Fires once per collection.
    Synchronized { records: Vec<Value> },
    /// Contents replaced by a fresh retrieval after notifications were lost.
    Reset { records: Vec<Value> },
    /// Records appended after identifier dedup.
    Inserted { records: Vec<Value> },
    /// Record with this identifier removed.
    Removed { id: Value },
    /// Record replaced wholesale.
    Updated { record: Value, index: Option<usize> },
    Pushed { records: Vec<Value> },
    Unshifted { records: Vec<Value> },
    Popped { record: Value },
    Shifted { record: Value },
    /// Positions `[index, index + count)` replaced by `records`.
    Spliced {
        index: usize,
        count: usize,
        records: Vec<Value>,
    },
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Synchronized { .. } => ChangeKind::Synchronized,
            Change::Reset { .. } => ChangeKind::Reset,
            Change::Inserted { .. } => ChangeKind::Inserted,
            Change::Removed { .. } => ChangeKind::Removed,
            Change::Updated { .. } => ChangeKind::Updated,
            Change::Pushed { .. } => ChangeKind::Pushed,
            Change::Unshifted { .. } => ChangeKind::Unshifted,
            Change::Popped { .. } => ChangeKind::Popped,
            Change::Shifted { .. } => ChangeKind::Shifted,
            Change::Spliced { .. } => ChangeKind::Spliced,
        }
    }
}

/// Ordered observer list plus the cached length it maintains.
pub struct Notifier {
    /// Most recently registered first.
    observers: RwLock<Vec<Observer>>,
    length: AtomicUsize,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            length: AtomicUsize::new(0),
        }
    }

    /// Register an observer ahead of all existing ones.
    pub fn observe(&self, observer: Observer) {
        self.observers.write().insert(0, observer);
    }

    /// Publish `change`; `len` is the mirror length after the change.
    pub fn notify(&self, change: &Change, len: usize) {
        self.length.store(len, Ordering::Release);

        // Snapshot so observers can register observers while being called.
        let observers: Vec<Observer> = self.observers.read().clone();
        for observer in &observers {
            observer(change, len);
        }
    }

    /// Length as of the last notification.
    pub fn len(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_most_recent_observer_fires_first() {
        let notifier = Notifier::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let order = order.clone();
            notifier.observe(Arc::new(move |_: &Change, _: usize| order.lock().push(name)));
        }

        notifier.notify(&Change::Removed { id: json!("a") }, 0);
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
    }

    #[test]
    fn test_length_is_current_inside_observers() {
        let notifier = Arc::new(Notifier::new());
        let seen = Arc::new(Mutex::new(None));

        let n = notifier.clone();
        let s = seen.clone();
        notifier.observe(Arc::new(move |_: &Change, len: usize| {
            *s.lock() = Some((len, n.len()));
        }));

        notifier.notify(&Change::Inserted { records: vec![json!({}), json!({})] }, 2);
        assert_eq!(*seen.lock(), Some((2, 2)));
        assert_eq!(notifier.len(), 2);
    }

    #[test]
    fn test_observer_may_register_during_notify() {
        let notifier = Arc::new(Notifier::new());
        let n = notifier.clone();
        notifier.observe(Arc::new(move |_: &Change, _: usize| {
            n.observe(Arc::new(|_: &Change, _: usize| {}))
        }));

        notifier.notify(&Change::Synchronized { records: vec![] }, 0);
        assert_eq!(notifier.observer_count(), 2);
    }

    #[test]
    fn test_change_kind_tags() {
        assert_eq!(Change::Synchronized { records: vec![] }.kind().as_str(), "synchronized");
        assert_eq!(Change::Popped { record: json!(1) }.kind().as_str(), "pop");
        assert_eq!(
            Change::Spliced { index: 0, count: 1, records: vec![] }.kind(),
            ChangeKind::Spliced
        );
    }
}
