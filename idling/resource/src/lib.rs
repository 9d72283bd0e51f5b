//! The idling-resource contract.
//!
//! An idling resource represents asynchronous work that a UI test must wait
//! for. It reports whether it is idle right now and, once given a callback,
//! fires it on every transition from busy to idle.

extern crate arc_swap;
#[macro_use]
extern crate log;

#[cfg(test)]
extern crate env_logger;
#[cfg(test)]
#[macro_use]
extern crate quickcheck;

use arc_swap::ArcSwapOption;
use std::{fmt, sync::Arc};

mod counting;

pub use self::counting::{Busy, CountingIdlingResource};

/// A source of asynchronous work that tests synchronize with.
///
/// Implementations are shared between the thread that performs the work and
/// the registry's owner thread, so every method takes `&self`.
pub trait IdlingResource: Send + Sync {
    /// Identifies the resource in diagnostics. Should be unique within a
    /// registry.
    fn name(&self) -> &str;

    /// Whether the resource is idle at this instant.
    ///
    /// Must agree with the last callback: once the callback has fired, and
    /// until the resource becomes busy again, this returns true.
    fn is_idle_now(&self) -> bool;

    /// Stores the callback to fire on each busy→idle transition.
    ///
    /// Only one callback is held; installing another replaces it.
    fn register_idle_transition_callback(&self, callback: ResourceCallback);
}

/// Notified when a resource transitions from busy to idle.
///
/// May be invoked on any thread.
#[derive(Clone)]
pub struct ResourceCallback(Arc<dyn Fn() + Send + Sync>);

/// A single callback slot, readable and replaceable from any thread without
/// locking.
#[derive(Default)]
pub struct CallbackSlot(ArcSwapOption<ResourceCallback>);

// ===== impl ResourceCallback =====

impl ResourceCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        ResourceCallback(Arc::new(f))
    }

    pub fn on_transition_to_idle(&self) {
        (self.0)()
    }
}

impl fmt::Debug for ResourceCallback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.pad("ResourceCallback")
    }
}

// ===== impl CallbackSlot =====

impl CallbackSlot {
    pub fn new() -> Self {
        CallbackSlot(ArcSwapOption::default())
    }

    /// Replaces the held callback.
    pub fn set(&self, callback: ResourceCallback) {
        self.0.store(Some(Arc::new(callback)));
    }

    pub fn is_set(&self) -> bool {
        self.0.load().is_some()
    }

    /// Fires the held callback, if any. Returns whether one was fired.
    pub fn notify(&self) -> bool {
        match self.0.load_full() {
            Some(callback) => {
                callback.on_transition_to_idle();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("CallbackSlot").field(&self.is_set()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, ResourceCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let callback = ResourceCallback::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[test]
    fn empty_slot_does_not_notify() {
        let slot = CallbackSlot::new();
        assert!(!slot.is_set());
        assert!(!slot.notify());
    }

    #[test]
    fn last_registration_wins() {
        let slot = CallbackSlot::new();
        let (first, cb1) = counter();
        let (second, cb2) = counter();

        slot.set(cb1);
        slot.set(cb2);
        assert!(slot.notify());

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stores_are_visible_across_threads() {
        let slot = Arc::new(CallbackSlot::new());
        let (count, callback) = counter();

        let remote = slot.clone();
        ::std::thread::spawn(move || remote.set(callback)).join().unwrap();

        assert!(slot.notify());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
