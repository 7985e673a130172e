//! Publish registry for change notifications.
//!
//! Every subscriber receives each event once, in subscription order.
//! Unsubscribing stops future notifications only; nothing is replayed to a
//! late subscriber.

use std::collections::BTreeMap;
use std::fmt;

/// Handle returned by [`Observers::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Callback<E> = Box<dyn FnMut(&E) + Send>;

/// A set of callbacks interested in events of type `E`.
pub struct Observers<E> {
    next_id: u64,
    callbacks: BTreeMap<SubscriptionId, Callback<E>>,
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            callbacks: BTreeMap::new(),
        }
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.callbacks.insert(id, Box::new(callback));
        id
    }

    /// Returns false if the subscription was unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    pub fn notify(&mut self, event: &E) {
        for callback in self.callbacks.values_mut() {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("subscribers", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_multiple_subscribers_receive_events() {
        let mut observers = Observers::new();
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));

        let a = seen_a.clone();
        observers.subscribe(move |e: &u32| a.lock().unwrap().push(*e));
        let b = seen_b.clone();
        observers.subscribe(move |e: &u32| b.lock().unwrap().push(*e * 10));

        observers.notify(&1);
        observers.notify(&2);

        assert_eq!(*seen_a.lock().unwrap(), vec![1, 2]);
        assert_eq!(*seen_b.lock().unwrap(), vec![10, 20]);
    }

    #[test]
    fn test_unsubscribe_stops_future_notifications() {
        let mut observers = Observers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let id = observers.subscribe(move |e: &u32| s.lock().unwrap().push(*e));

        observers.notify(&1);
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.notify(&2);

        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert!(observers.is_empty());
    }
}
