use std::{
    cmp,
    fmt,
    sync::{Arc, atomic::{AtomicIsize, AtomicU64, Ordering}},
    time::{Duration, Instant},
};

use {CallbackSlot, IdlingResource, ResourceCallback};

/// An idling resource that counts in-flight operations.
///
/// Call `increment()` before starting asynchronous work and `decrement()`
/// when it completes; the resource is idle whenever the count is zero. Both
/// may be called from any thread.
///
/// Decrementing more often than incrementing is a bug in the caller and
/// panics.
pub struct CountingIdlingResource {
    name: String,
    count: AtomicIsize,
    debug_counting: bool,
    callback: CallbackSlot,

    /// Diagnostic transition times, in milliseconds after `created` plus one.
    /// Zero means never.
    created: Instant,
    became_busy: AtomicU64,
    became_idle: AtomicU64,
}

/// Holds a `CountingIdlingResource` busy until dropped.
#[derive(Debug)]
pub struct Busy(Option<Arc<CountingIdlingResource>>);

// ===== impl CountingIdlingResource =====

impl CountingIdlingResource {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self::with_debug_counting(name, false)
    }

    /// Creates a resource that logs every change to its count.
    pub fn with_debug_counting<N: Into<String>>(name: N, debug_counting: bool) -> Self {
        CountingIdlingResource {
            name: name.into(),
            count: AtomicIsize::new(0),
            debug_counting,
            callback: CallbackSlot::new(),
            created: Instant::now(),
            became_busy: AtomicU64::new(0),
            became_idle: AtomicU64::new(0),
        }
    }

    pub fn increment(&self) {
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            self.became_busy.store(self.stamp(), Ordering::Relaxed);
        }

        if self.debug_counting {
            info!("Resource: {} in-use-count incremented to: {}", self.name, prev + 1);
        }
    }

    /// Decrements the count, firing the idle-transition callback if it
    /// reaches zero.
    ///
    /// # Panics
    ///
    /// If the count drops below zero.
    pub fn decrement(&self) {
        let count = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        if count < 0 {
            panic!(
                "Counter has been corrupted! Resource {:?} was decremented below zero ({})",
                self.name, count
            );
        }

        if count == 0 {
            self.became_idle.store(self.stamp(), Ordering::Relaxed);
            self.callback.notify();
        }

        if self.debug_counting {
            if count == 0 {
                info!("Resource: {} went idle!", self.name);
            } else {
                info!("Resource: {} in-use-count decremented to: {}", self.name, count);
            }
        }
    }

    /// Increments the count and returns a guard that decrements it on drop.
    pub fn busy(this: &Arc<Self>) -> Busy {
        this.increment();
        Busy(Some(this.clone()))
    }

    /// The number of operations in flight.
    pub fn count(&self) -> usize {
        cmp::max(0, self.count.load(Ordering::Acquire)) as usize
    }

    /// Logs the current count and the most recent transitions.
    pub fn dump_state_to_logs(&self) {
        let busy = self.became_busy.load(Ordering::Relaxed);
        let idle = self.became_idle.load(Ordering::Relaxed);
        let age = |stamp: u64| Duration::from_millis(stamp - 1);

        info!("Resource: {} inflight transaction count: {}", self.name, self.count());
        if busy == 0 {
            info!("Resource: {} has never been busy", self.name);
            return;
        }
        info!("Resource: {} last became busy {:?} after creation", self.name, age(busy));
        if idle == 0 {
            info!("Resource: {} has never gone idle", self.name);
        } else {
            info!("Resource: {} last went idle {:?} after creation", self.name, age(idle));
        }
    }

    fn stamp(&self) -> u64 {
        self.created.elapsed().as_millis() as u64 + 1
    }
}

impl IdlingResource for CountingIdlingResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_idle_now(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }

    fn register_idle_transition_callback(&self, callback: ResourceCallback) {
        self.callback.set(callback);
    }
}

impl fmt::Debug for CountingIdlingResource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CountingIdlingResource")
            .field("name", &self.name)
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish()
    }
}

// ===== impl Busy =====

impl Drop for Busy {
    fn drop(&mut self) {
        if let Some(resource) = self.0.take() {
            resource.decrement();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::{Arc, atomic::{AtomicUsize, Ordering}}, thread};

    use env_logger;
    use {IdlingResource, ResourceCallback};
    use super::*;

    fn counted(resource: &CountingIdlingResource) -> Arc<AtomicUsize> {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        resource.register_idle_transition_callback(ResourceCallback::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        fired
    }

    #[test]
    fn idle_after_balanced_calls() {
        let _ = env_logger::try_init();
        let resource = CountingIdlingResource::with_debug_counting("images", true);
        let fired = counted(&resource);
        assert!(resource.is_idle_now());

        resource.increment();
        assert!(!resource.is_idle_now());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        resource.decrement();
        assert!(resource.is_idle_now());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        resource.dump_state_to_logs();
    }

    #[test]
    fn not_idle_while_nested() {
        let resource = CountingIdlingResource::new("nested");
        let fired = counted(&resource);

        resource.increment();
        resource.increment();
        resource.decrement();
        assert!(!resource.is_idle_now());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(resource.count(), 1);

        resource.decrement();
        assert!(resource.is_idle_now());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "Counter has been corrupted")]
    fn decrement_at_zero_panics() {
        let resource = CountingIdlingResource::new("unbalanced");
        resource.decrement();
    }

    #[test]
    #[should_panic(expected = "Counter has been corrupted")]
    fn extra_decrement_panics() {
        let resource = CountingIdlingResource::new("unbalanced");
        resource.increment();
        resource.decrement();
        resource.decrement();
    }

    #[test]
    fn fires_once_per_transition() {
        let resource = CountingIdlingResource::new("cycles");
        let fired = counted(&resource);

        for n in 1..6 {
            resource.increment();
            resource.decrement();
            // Idle checks never fire the callback.
            assert!(resource.is_idle_now());
            assert!(resource.is_idle_now());
            assert_eq!(fired.load(Ordering::SeqCst), n);
        }
    }

    #[test]
    fn busy_guard_decrements_on_drop() {
        let resource = Arc::new(CountingIdlingResource::new("guarded"));
        let fired = counted(&resource);

        let a = CountingIdlingResource::busy(&resource);
        let b = CountingIdlingResource::busy(&resource);
        assert_eq!(resource.count(), 2);

        drop(a);
        assert!(!resource.is_idle_now());
        drop(b);
        assert!(resource.is_idle_now());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn counts_across_threads() {
        let resource = Arc::new(CountingIdlingResource::new("threads"));
        let fired = counted(&resource);

        let workers = (0..8)
            .map(|_| {
                let resource = resource.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _busy = CountingIdlingResource::busy(&resource);
                    }
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(resource.is_idle_now());
        assert!(fired.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn dump_without_activity() {
        let resource = CountingIdlingResource::new("quiet");
        resource.dump_state_to_logs();
        assert_eq!(resource.count(), 0);
    }

    quickcheck! {
        fn balanced_nesting_fires_once_per_edge(depths: Vec<u8>) -> bool {
            let resource = CountingIdlingResource::new("prop");
            let fired = counted(&resource);

            for depth in &depths {
                let depth = *depth % 8 + 1;
                for _ in 0..depth {
                    resource.increment();
                }
                for _ in 0..depth {
                    resource.decrement();
                }
            }

            resource.is_idle_now() && fired.load(Ordering::SeqCst) == depths.len()
        }
    }
}
