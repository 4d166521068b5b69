//! Ordered listener lists with drop-to-unsubscribe handles.

use std::sync::{Arc, Mutex, Weak};
use tracing::warn;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// Listeners invoked in registration order.
pub struct Listeners<T> {
    inner: Arc<Mutex<ListenerSet<T>>>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerSet {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// subscription is dropped or unsubscribed.
    pub fn add<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = match self.inner.lock() {
            Ok(mut set) => {
                let id = set.next_id;
                set.next_id += 1;
                set.entries.push((id, Arc::new(listener)));
                id
            }
            Err(_) => {
                warn!("Listener list poisoned, listener not registered");
                return Subscription { remove: None };
            }
        };

        let weak: Weak<Mutex<ListenerSet<T>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if let Ok(mut set) = inner.lock() {
                        set.entries.retain(|(entry_id, _)| *entry_id != id);
                    }
                }
            })),
        }
    }

    /// Invoke every listener with `value`.
    ///
    /// The list is snapshotted first, so a listener may unsubscribe itself
    /// or register others while being called.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = match self.inner.lock() {
            Ok(set) => set.entries.iter().map(|(_, cb)| cb.clone()).collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            listener(value);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|set| set.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Registration handle. Dropping it removes the listener.
#[must_use = "dropping a subscription unregisters the listener"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listeners_called_in_registration_order() {
        let listeners: Listeners<u32> = Listeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let seen = seen.clone();
            listeners.add(move |v| seen.lock().unwrap().push(("first", *v)))
        };
        let second = {
            let seen = seen.clone();
            listeners.add(move |v| seen.lock().unwrap().push(("second", *v)))
        };

        listeners.notify(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);

        drop(first);
        drop(second);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let listeners: Listeners<bool> = Listeners::new();
        let sub = listeners.add(|_| {});
        assert_eq!(listeners.len(), 1);

        drop(sub);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let listeners: Listeners<bool> = Listeners::new();
        let hits = Arc::new(Mutex::new(0));

        let sub = {
            let hits = hits.clone();
            listeners.add(move |_| *hits.lock().unwrap() += 1)
        };
        listeners.notify(&true);
        sub.unsubscribe();
        listeners.notify(&false);

        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_subscription_outliving_list_is_harmless() {
        let listeners: Listeners<bool> = Listeners::new();
        let sub = listeners.add(|_| {});
        drop(listeners);
        drop(sub);
    }
}
