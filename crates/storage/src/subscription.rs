use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;

/// Snapshot callback. Every invocation carries the full current state, never a diff.
pub type Listener<T> = Arc<dyn Fn(T) + Send + Sync>;

type Cancel = Box<dyn FnOnce() + Send + Sync>;

/// Explicit unsubscribe capability for one listener registration.
///
/// Dropping the handle unsubscribes as well; once either happens the listener
/// receives no further snapshots.
#[must_use = "dropping a Subscription immediately unsubscribes its listener"]
pub struct Subscription {
    cancel: Option<Cancel>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

/// Holds at most one active subscription for a logical slot (current chat, chat list).
///
/// Installing a new subscription unsubscribes the previous one first.
#[derive(Debug, Default)]
pub struct SubscriptionSlot {
    current: Option<Subscription>,
}

impl SubscriptionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, next: Subscription) {
        self.clear();
        self.current = Some(next);
    }

    /// Returns true when an active subscription was cancelled.
    pub fn clear(&mut self) -> bool {
        match self.current.take() {
            Some(subscription) => {
                subscription.unsubscribe();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|subscription| subscription.is_active())
    }
}

pub(crate) struct Registration<K, T> {
    id: u64,
    key: K,
    active: Arc<AtomicBool>,
    listener: Listener<T>,
}

impl<K, T> Registration<K, T> {
    pub(crate) fn deliver(&self, snapshot: T) {
        // A notifier may hold a list loaded just before removal; the flag closes that gap.
        if self.active.load(Ordering::SeqCst) {
            (self.listener)(snapshot);
        }
    }
}

/// Keyed listener registry shared by the store implementations.
pub(crate) struct Topic<K, T> {
    next_id: AtomicU64,
    registrations: Arc<ArcSwap<Vec<Arc<Registration<K, T>>>>>,
}

impl<K, T> Default for Topic<K, T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            registrations: Arc::new(ArcSwap::from_pointee(Vec::new())),
        }
    }
}

impl<K, T> Topic<K, T>
where
    K: PartialEq + Send + Sync + 'static,
    T: Clone + 'static,
{
    pub(crate) fn register(
        &self,
        key: K,
        listener: Listener<T>,
    ) -> (Subscription, Arc<Registration<K, T>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let registration = Arc::new(Registration {
            id,
            key,
            active: Arc::clone(&active),
            listener,
        });

        self.registrations.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&registration));
            next
        });

        let registrations: Weak<ArcSwap<Vec<Arc<Registration<K, T>>>>> =
            Arc::downgrade(&self.registrations);
        let subscription = Subscription::new(move || {
            active.store(false, Ordering::SeqCst);
            if let Some(registrations) = registrations.upgrade() {
                registrations.rcu(|current| {
                    current
                        .iter()
                        .filter(|registration| registration.id != id)
                        .cloned()
                        .collect::<Vec<_>>()
                });
            }
            tracing::trace!(registration_id = id, "listener unsubscribed");
        });

        (subscription, registration)
    }

    pub(crate) fn has_listeners(&self, key: &K) -> bool {
        self.registrations
            .load()
            .iter()
            .any(|registration| registration.key == *key)
    }

    /// Delivers `snapshot` to every active listener registered under `key`.
    pub(crate) fn notify(&self, key: &K, snapshot: T) {
        let registrations = self.registrations.load_full();
        for registration in registrations.iter().filter(|r| r.key == *key) {
            registration.deliver(snapshot.clone());
        }
    }
}
