//! Observable subjects
//!
//! **Why**: The player publishes state (current time, frame, cache fill)
//! without knowing who listens. Subjects hold observers as weak slots, so a
//! consumer that goes away never has to deregister explicitly.
//!
//! **Used by**: player core (all `observe_*` outputs), hosts (renderer,
//! audio sink, UI bridges)
//!
//! # Threading
//!
//! Callbacks run synchronously on the thread that called `set`, in set
//! order per subject. Observers must not call `set` or `observe` on the
//! subject they are observing from inside the callback; that re-entrancy is
//! unsupported by design, not guarded at runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Whether `observe` fires the callback immediately with the current value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnObserve {
    Suppress,
    Trigger,
}

/// Keeps an observer registered; dropping it unsubscribes
#[must_use = "dropping the subscription unsubscribes the observer"]
pub struct Subscription {
    _token: Arc<()>,
}

struct Slot<P: ?Sized> {
    alive: Weak<()>,
    callback: Box<dyn Fn(&P) + Send>,
}

fn notify<P: ?Sized>(observers: &Mutex<Vec<Slot<P>>>, payload: &P) {
    let mut slots = observers.lock().unwrap_or_else(|e| e.into_inner());
    slots.retain(|s| s.alive.strong_count() > 0);
    for slot in slots.iter() {
        (slot.callback)(payload);
    }
}

fn subscribe<P: ?Sized>(
    observers: &Mutex<Vec<Slot<P>>>,
    callback: Box<dyn Fn(&P) + Send>,
) -> Subscription {
    let token = Arc::new(());
    let slot = Slot { alive: Arc::downgrade(&token), callback };
    observers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(slot);
    Subscription { _token: token }
}

/// Single-value subject
pub struct ObservableValue<T> {
    inner: Arc<ValueInner<T>>,
}

struct ValueInner<T> {
    value: Mutex<T>,
    observers: Mutex<Vec<Slot<T>>>,
}

impl<T: Clone + Send + 'static> ObservableValue<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(ValueInner {
                value: Mutex::new(value),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner
            .value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Store and notify unconditionally
    pub fn set(&self, value: T) {
        {
            let mut v = self.inner.value.lock().unwrap_or_else(|e| e.into_inner());
            *v = value.clone();
        }
        notify(&self.inner.observers, &value);
    }

    /// Register a callback; fires immediately when `Trigger`
    pub fn observe(
        &self,
        callback: impl Fn(&T) + Send + 'static,
        on_observe: OnObserve,
    ) -> Subscription {
        let sub = subscribe(&self.inner.observers, Box::new(callback));
        if on_observe == OnObserve::Trigger {
            let current = self.get();
            let slots = self
                .inner
                .observers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = slots.last() {
                (slot.callback)(&current);
            }
        }
        sub
    }
}

impl<T: Clone + PartialEq + Send + 'static> ObservableValue<T> {
    /// Store and notify only when the value changed; returns whether it did
    pub fn set_if_changed(&self, value: T) -> bool {
        {
            let mut v = self.inner.value.lock().unwrap_or_else(|e| e.into_inner());
            if *v == value {
                return false;
            }
            *v = value.clone();
        }
        notify(&self.inner.observers, &value);
        true
    }
}

impl<T> Clone for ObservableValue<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// List subject; callbacks receive the whole list
pub struct ObservableList<T> {
    inner: Arc<ListInner<T>>,
}

struct ListInner<T> {
    value: Mutex<Vec<T>>,
    observers: Mutex<Vec<Slot<[T]>>>,
}

impl<T: Clone + Send + 'static> ObservableList<T> {
    pub fn new(value: Vec<T>) -> Self {
        Self {
            inner: Arc::new(ListInner {
                value: Mutex::new(value),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn get(&self) -> Vec<T> {
        self.inner
            .value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set(&self, value: Vec<T>) {
        {
            let mut v = self.inner.value.lock().unwrap_or_else(|e| e.into_inner());
            *v = value.clone();
        }
        notify(&self.inner.observers, value.as_slice());
    }

    pub fn observe(
        &self,
        callback: impl Fn(&[T]) + Send + 'static,
        on_observe: OnObserve,
    ) -> Subscription {
        let sub = subscribe(&self.inner.observers, Box::new(callback));
        if on_observe == OnObserve::Trigger {
            let current = self.get();
            let slots = self
                .inner
                .observers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = slots.last() {
                (slot.callback)(current.as_slice());
            }
        }
        sub
    }
}

impl<T: Clone + PartialEq + Send + 'static> ObservableList<T> {
    pub fn set_if_changed(&self, value: Vec<T>) -> bool {
        {
            let mut v = self.inner.value.lock().unwrap_or_else(|e| e.into_inner());
            if *v == value {
                return false;
            }
            *v = value.clone();
        }
        notify(&self.inner.observers, value.as_slice());
        true
    }
}

impl<T> Clone for ObservableList<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// Map subject; callbacks receive the whole map
pub struct ObservableMap<K, V> {
    inner: Arc<MapInner<K, V>>,
}

struct MapInner<K, V> {
    value: Mutex<HashMap<K, V>>,
    observers: Mutex<Vec<Slot<HashMap<K, V>>>>,
}

impl<K, V> ObservableMap<K, V>
where
    K: Clone + std::hash::Hash + Eq + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(value: HashMap<K, V>) -> Self {
        Self {
            inner: Arc::new(MapInner {
                value: Mutex::new(value),
                observers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn get(&self) -> HashMap<K, V> {
        self.inner
            .value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get_item(&self, key: &K) -> Option<V> {
        self.inner
            .value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn set(&self, value: HashMap<K, V>) {
        {
            let mut v = self.inner.value.lock().unwrap_or_else(|e| e.into_inner());
            *v = value.clone();
        }
        notify(&self.inner.observers, &value);
    }

    pub fn observe(
        &self,
        callback: impl Fn(&HashMap<K, V>) + Send + 'static,
        on_observe: OnObserve,
    ) -> Subscription {
        let sub = subscribe(&self.inner.observers, Box::new(callback));
        if on_observe == OnObserve::Trigger {
            let current = self.get();
            let slots = self
                .inner
                .observers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = slots.last() {
                (slot.callback)(&current);
            }
        }
        sub
    }
}

impl<K, V> ObservableMap<K, V>
where
    K: Clone + std::hash::Hash + Eq + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    pub fn set_if_changed(&self, value: HashMap<K, V>) -> bool {
        {
            let mut v = self.inner.value.lock().unwrap_or_else(|e| e.into_inner());
            if *v == value {
                return false;
            }
            *v = value.clone();
        }
        notify(&self.inner.observers, &value);
        true
    }
}

impl<K, V> Clone for ObservableMap<K, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_set_notifies_in_order() {
        let subject = ObservableValue::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let _sub = subject.observe(
            move |v| seen2.lock().unwrap().push(*v),
            OnObserve::Suppress,
        );

        subject.set(1);
        subject.set(2);
        subject.set(3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_set_if_changed_fires_once() {
        let subject = ObservableValue::new(5);
        let fired = Arc::new(AtomicI32::new(0));
        let fired2 = Arc::clone(&fired);
        let _sub = subject.observe(
            move |_| {
                fired2.fetch_add(1, Ordering::SeqCst);
            },
            OnObserve::Suppress,
        );

        assert!(!subject.set_if_changed(5));
        assert!(subject.set_if_changed(6));
        assert!(!subject.set_if_changed(6));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(subject.get(), 6);
    }

    #[test]
    fn test_initial_fire_policy() {
        let subject = ObservableValue::new(42);
        let fired = Arc::new(AtomicI32::new(0));

        let f = Arc::clone(&fired);
        let _suppressed = subject.observe(
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
            OnObserve::Suppress,
        );
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let f = Arc::clone(&fired);
        let _triggered = subject.observe(
            move |v| {
                assert_eq!(*v, 42);
                f.fetch_add(1, Ordering::SeqCst);
            },
            OnObserve::Trigger,
        );
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_subscription_stops_callbacks() {
        let subject = ObservableValue::new(0);
        let fired = Arc::new(AtomicI32::new(0));
        let f = Arc::clone(&fired);
        let sub = subject.observe(
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
            OnObserve::Suppress,
        );

        subject.set(1);
        drop(sub);
        subject.set(2);
        subject.set(3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_list_subject() {
        let subject = ObservableList::new(vec![1, 2]);
        let total = Arc::new(AtomicI32::new(0));
        let t = Arc::clone(&total);
        let _sub = subject.observe(
            move |items: &[i32]| {
                t.store(items.iter().sum(), Ordering::SeqCst);
            },
            OnObserve::Trigger,
        );
        assert_eq!(total.load(Ordering::SeqCst), 3);

        assert!(subject.set_if_changed(vec![5, 5, 5]));
        assert_eq!(total.load(Ordering::SeqCst), 15);
        assert_eq!(subject.len(), 3);
    }

    #[test]
    fn test_map_subject() {
        let subject: ObservableMap<String, i32> = ObservableMap::new(HashMap::new());
        let fired = Arc::new(AtomicI32::new(0));
        let f = Arc::clone(&fired);
        let _sub = subject.observe(
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
            OnObserve::Suppress,
        );

        let mut m = HashMap::new();
        m.insert("bytes".to_string(), 10);
        assert!(subject.set_if_changed(m.clone()));
        assert!(!subject.set_if_changed(m));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(subject.get_item(&"bytes".to_string()), Some(10));
    }

    #[test]
    fn test_shared_handles_see_one_value() {
        let a = ObservableValue::new(1);
        let b = a.clone();
        b.set(9);
        assert_eq!(a.get(), 9);
    }
}
