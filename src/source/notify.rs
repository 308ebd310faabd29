use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::types::{Epoch, NodeRef};

/// What changed in the tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Root recreated; every level is being refetched.
    Reset,
    /// One batch of pages was merged.
    Merged {
        /// Level of the merged rows.
        level: usize,
        /// Parents that received rows.
        targets: Vec<NodeRef>,
        /// Rows added across the batch.
        rows: usize,
    },
    /// Children of every node at `level` were reset for a new breakdown.
    Reconfigured {
        /// Deepest level left untouched.
        level: usize,
    },
    /// Levels deeper than `depth` were dropped.
    Pruned {
        /// New tree depth.
        depth: usize,
    },
    /// Rows were replaced after an edit.
    RowsReplaced {
        /// Number of rows replaced.
        rows: usize,
    },
}

/// Notification delivered to subscribers after each tree mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    /// What changed.
    pub kind: ChangeKind,
    /// Configuration epoch the mutation belongs to.
    pub epoch: Epoch,
    /// Tree revision after the mutation.
    pub revision: u64,
}

type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

/// Per-data-source observer list.
pub(crate) struct ChangeNotifier {
    registry: Arc<Registry>,
    revisions: watch::Sender<u64>,
}

impl ChangeNotifier {
    pub(crate) fn new() -> Self {
        let (revisions, _) = watch::channel(0);
        Self {
            registry: Arc::new(Registry::default()),
            revisions,
        }
    }

    pub(crate) fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.callbacks.lock().push((id, Arc::new(callback)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub(crate) fn watch(&self) -> watch::Receiver<u64> {
        self.revisions.subscribe()
    }

    /// Delivers `event` to every subscriber. Callbacks run outside the
    /// registry lock and may subscribe, unsubscribe, or read the tree.
    pub(crate) fn publish(&self, event: ChangeEvent) {
        self.revisions.send_replace(event.revision);
        let callbacks: Vec<Callback> = self
            .registry
            .callbacks
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(&event);
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.registry.callbacks.lock().len()
    }
}

/// Keeps a change callback registered; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Unsubscribes now. Equivalent to dropping the handle.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.callbacks.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event(revision: u64) -> ChangeEvent {
        ChangeEvent {
            kind: ChangeKind::Reset,
            epoch: Epoch(1),
            revision,
        }
    }

    #[test]
    fn delivers_until_dropped() {
        let notifier = ChangeNotifier::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = notifier.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        notifier.publish(event(1));
        notifier.publish(event(2));
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        drop(sub);
        assert_eq!(notifier.subscriber_count(), 0);
        notifier.publish(event(3));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn notifiers_do_not_cross_talk() {
        let first = ChangeNotifier::new();
        let second = ChangeNotifier::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _sub = first.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        second.publish(event(1));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_may_unsubscribe_others() {
        let notifier = Arc::new(ChangeNotifier::new());
        let victim = Arc::new(Mutex::new(Some(notifier.subscribe(|_| {}))));
        let handle = Arc::clone(&victim);
        let _sub = notifier.subscribe(move |_| {
            handle.lock().take();
        });
        notifier.publish(event(1));
        assert_eq!(notifier.subscriber_count(), 1);
    }

    #[test]
    fn watch_sees_latest_revision() {
        let notifier = ChangeNotifier::new();
        let rx = notifier.watch();
        notifier.publish(event(7));
        assert_eq!(*rx.borrow(), 7);
    }
}
