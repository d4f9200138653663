//! Subscriber bus: observers notified after every applied commit.

use crate::record::CommitRecord;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Observer invoked with the applied record and the state after the commit.
pub type Subscriber<S> = Arc<dyn Fn(&CommitRecord, &S) + Send + Sync>;

/// Identifier handed out for each subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

/// Ordered list of subscribers.
pub struct SubscriberBus<S> {
    entries: Mutex<Vec<(SubscriberId, Subscriber<S>)>>,
    next_id: AtomicU64,
}

impl<S> SubscriberBus<S> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, subscriber: F) -> SubscriberId
    where
        F: Fn(&CommitRecord, &S) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, Arc::new(subscriber)));
        id
    }

    /// Remove a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|(entry, _)| *entry == id) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Invoke every subscriber in subscription order.
    ///
    /// Iterates over a copy of the list taken before the first call, so
    /// subscribers may subscribe or unsubscribe (themselves or others) while
    /// being notified.
    pub fn notify(&self, record: &CommitRecord, state: &S) {
        let snapshot: Vec<Subscriber<S>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();
        for subscriber in snapshot {
            subscriber(record, state);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<S> Default for SubscriberBus<S> {
    fn default() -> Self {
        Self::new()
    }
}

trait Detach: Send + Sync {
    fn detach(&self, id: SubscriberId) -> bool;
}

impl<S: 'static> Detach for SubscriberBus<S> {
    fn detach(&self, id: SubscriberId) -> bool {
        self.unsubscribe(id)
    }
}

/// Handle returned by a subscription; call [`Subscription::unsubscribe`] to
/// stop receiving notifications. Dropping the handle keeps the subscriber.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriberId,
    bus: Weak<dyn Detach>,
}

impl Subscription {
    pub fn new<S: 'static>(bus: &Arc<SubscriberBus<S>>, id: SubscriberId) -> Self {
        let bus: Arc<dyn Detach> = bus.clone();
        Self {
            id,
            bus: Arc::downgrade(&bus),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Returns `false` if the subscriber was already removed or the bus is gone.
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.detach(self.id),
            None => false,
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
    use serde_json::Value;

    fn record() -> CommitRecord {
        CommitRecord::new("touch", Value::Null)
    }

    #[test]
    fn test_notify_in_subscription_order() {
        let bus = SubscriberBus::<()>::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let calls = calls.clone();
            bus.subscribe(move |_, _| calls.lock().push(name));
        }

        bus.notify(&record(), &());
        assert_eq!(*calls.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe_during_notify() {
        let bus = Arc::new(SubscriberBus::<()>::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let handle: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let self_removing = {
            let calls = calls.clone();
            let handle = handle.clone();
            bus.subscribe(move |_, _| {
                calls.lock().push("once");
                if let Some(subscription) = handle.lock().as_ref() {
                    subscription.unsubscribe();
                }
            })
        };
        *handle.lock() = Some(Subscription::new(&bus, self_removing));

        let calls_after = calls.clone();
        bus.subscribe(move |_, _| calls_after.lock().push("always"));

        bus.notify(&record(), &());
        bus.notify(&record(), &());

        assert_eq!(*calls.lock(), vec!["once", "always", "always"]);
        assert_eq!(bus.len(), 1);
    }

    #[test]
    fn test_subscription_outliving_bus() {
        let bus = Arc::new(SubscriberBus::<()>::new());
        let id = bus.subscribe(|_, _| {});
        let subscription = Subscription::new(&bus, id);
        drop(bus);
        assert!(!subscription.unsubscribe());
    }

    #[test]
    fn test_double_unsubscribe() {
        let bus = Arc::new(SubscriberBus::<()>::new());
        let id = bus.subscribe(|_, _| {});
        let subscription = Subscription::new(&bus, id);
        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        assert!(bus.is_empty());
    }
}
