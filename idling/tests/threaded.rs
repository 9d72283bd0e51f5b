// These tests run a real owner thread against the wall clock.
#![cfg(feature = "flaky_tests")]

extern crate espresso_idling;
extern crate futures;

mod support;

use espresso_idling::{
    Config,
    CountingIdlingResource,
    IdlingResourceRegistry,
    Looper,
    Settled,
};
use futures::Future;
use std::{
    sync::{Arc, atomic::{AtomicBool, Ordering}, mpsc},
    thread,
    time::Duration,
};

use support::*;

/// A registry whose owner thread runs until dropped.
struct Owner {
    registry: Arc<IdlingResourceRegistry>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Owner {
    fn spawn(config: Config) -> Self {
        espresso_idling::logging::init();

        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let stopped = stop.clone();
        let thread = thread::Builder::new()
            .name("owner".into())
            .spawn(move || {
                let looper = Looper::new();
                let registry = IdlingResourceRegistry::new(looper.handle(), &config);
                tx.send(registry).unwrap();
                looper.run_until(|| stopped.load(Ordering::Acquire));
            })
            .unwrap();

        Owner {
            registry: rx.recv().unwrap(),
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.registry.looper().post(|| {});
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

#[test]
fn registers_from_another_thread() {
    let owner = Owner::spawn(Config::default());
    let a = Arc::new(CountingIdlingResource::new("a"));

    assert!(owner.registry.register(a.clone()));
    assert!(!owner.registry.register(a.clone()));
    assert_eq!(owner.registry.names(), names(&["a"]));

    assert!(owner.registry.unregister(&as_resource(&a)));
    assert!(owner.registry.is_empty());
}

#[test]
fn waits_for_a_worker_to_finish() {
    let owner = Owner::spawn(Config::default());
    let a = Arc::new(CountingIdlingResource::new("a"));
    assert!(owner.registry.register(a.clone()));
    a.increment();

    let idle = owner.registry.when_idle();
    let worker = {
        let a = a.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            a.decrement();
        })
    };

    assert_eq!(idle.wait(), Ok(Ok(Settled::Idle)));
    worker.join().unwrap();
}

#[test]
fn reports_resources_that_never_finish() {
    let owner = Owner::spawn(Config {
        timeout: Duration::from_millis(200),
        warning_interval: Duration::from_millis(50),
    });
    let stuck = Arc::new(CountingIdlingResource::new("stuck"));
    assert!(owner.registry.register(stuck.clone()));
    stuck.increment();

    assert_eq!(
        owner.registry.when_idle().wait(),
        Ok(Ok(Settled::TimedOut(names(&["stuck"]))))
    );
}

#[test]
fn registration_fails_once_the_looper_is_gone() {
    let owner = Owner::spawn(Config::default());
    let registry = owner.registry.clone();
    drop(owner);

    let a = Arc::new(CountingIdlingResource::new("a"));
    assert!(!registry.register(a));
}
