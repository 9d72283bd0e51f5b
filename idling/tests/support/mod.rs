#![allow(dead_code)]

use espresso_idling::{
    self,
    Config,
    CountingIdlingResource,
    IdleNotificationCallback,
    IdlingResource,
    IdlingResourceRegistry,
    Looper,
    ManualClock,
};
use std::{sync::{Arc, Mutex}, time::Duration};

/// What a `Recorder` was told, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Idle,
    Warning(Vec<String>),
    TimedOut(Vec<String>),
}

/// An `IdleNotificationCallback` that records every call.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Event>>>);

/// A registry on a looper whose clock only moves when told to.
pub struct Harness {
    pub clock: ManualClock,
    pub looper: Looper,
    pub registry: Arc<IdlingResourceRegistry>,
}

// ===== impl Recorder =====

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn idles(&self) -> usize {
        self.events().iter().filter(|e| **e == Event::Idle).count()
    }

    pub fn warnings(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| match **e {
                Event::Warning(_) => true,
                _ => false,
            })
            .count()
    }

    pub fn timeouts(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| match **e {
                Event::TimedOut(_) => true,
                _ => false,
            })
            .count()
    }

    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }
}

impl IdleNotificationCallback for Recorder {
    fn all_resources_idle(&mut self) {
        self.push(Event::Idle);
    }

    fn resources_still_busy_warning(&mut self, busy: &[String]) {
        self.push(Event::Warning(busy.to_vec()));
    }

    fn resources_have_timed_out(&mut self, busy: &[String]) {
        self.push(Event::TimedOut(busy.to_vec()));
    }
}

// ===== impl Harness =====

impl Harness {
    pub fn new(timeout: Duration, warning_interval: Duration) -> Self {
        espresso_idling::logging::init();

        let clock = ManualClock::default();
        let looper = Looper::with_clock(clock.clone());
        let config = Config { timeout, warning_interval };
        let registry = IdlingResourceRegistry::new(looper.handle(), &config);
        Harness { clock, looper, registry }
    }

    /// Creates and registers a counting resource.
    pub fn counting(&self, name: &str) -> Arc<CountingIdlingResource> {
        let resource = Arc::new(CountingIdlingResource::new(name));
        assert!(self.registry.register(resource.clone()));
        resource
    }

    /// Runs everything that is due now.
    pub fn run(&self) -> usize {
        self.looper.run_pending()
    }

    /// Moves the clock forward and runs everything that became due.
    pub fn advance(&self, d: Duration) -> usize {
        self.clock.advance(d);
        self.looper.run_pending()
    }
}

pub fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

pub fn as_resource<R: IdlingResource + 'static>(r: &Arc<R>) -> Arc<dyn IdlingResource> {
    r.clone()
}
