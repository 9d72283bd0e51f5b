use futures::{Future, sync::oneshot};
use indexmap::IndexMap;
use std::{
    any::Any,
    cmp,
    error,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::{Duration, Instant},
};

use config::Config;
use idling_resource::{IdlingResource, ResourceCallback};
use looper::{self, Handle, Token};

/// Receives the outcome of `notify_when_all_resources_are_idle`.
///
/// Callbacks run on the registry's owner thread.
pub trait IdleNotificationCallback: Send {
    /// Every registered resource is idle. Fires at most once per request.
    fn all_resources_idle(&mut self);

    /// The named resources are still busy; the registry will check again.
    fn resources_still_busy_warning(&mut self, busy: &[String]);

    /// The timeout elapsed while the named resources were busy. Fires at most
    /// once per request, and never together with `all_resources_idle`.
    fn resources_have_timed_out(&mut self, busy: &[String]);
}

/// How a wait for idleness ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settled {
    Idle,
    TimedOut(Vec<String>),
}

/// Resolves once the registry's resources have settled.
///
/// Fails with `Canceled` if the owner looper went away before settling.
pub type IdleFuture = oneshot::Receiver<Result<Settled, Error>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// An owner-only operation was called from another thread.
    WrongThread(looper::WrongThread),
    /// A notification request is already waiting for idleness.
    AlreadyPending,
    /// The owner looper was dropped before the operation could run there.
    LooperGone,
}

/// Tracks idling resources on behalf of the thread that owns a `Looper`.
///
/// The set of resources may be changed from any thread; those changes are
/// carried out on the owner thread. Queries and notification requests must
/// be made on the owner thread.
pub struct IdlingResourceRegistry {
    looper: Handle,
    timeout: Duration,
    warning_interval: Duration,
    me: Weak<IdlingResourceRegistry>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// Registered resources in registration order, keyed by allocation.
    resources: IndexMap<usize, Entry>,
    pending: Option<Pending>,
    generation: u64,
}

struct Entry {
    resource: Arc<dyn IdlingResource>,
    /// What `is_idle_now` last reported. Resources start out busy.
    idle: bool,
}

type SharedCallback = Arc<Mutex<Box<dyn IdleNotificationCallback>>>;

/// A request to be notified when every resource is idle.
struct Pending {
    callback: SharedCallback,
    generation: u64,
    started: Instant,
    warnings: u32,
    recheck: Option<Token>,
}

/// Forwards the outcome of a request to an `IdleFuture`.
struct Settle(Option<oneshot::Sender<Result<Settled, Error>>>);

// ===== impl IdlingResourceRegistry =====

impl IdlingResourceRegistry {
    /// Creates a registry owned by the looper's thread.
    pub fn new(looper: Handle, config: &Config) -> Arc<Self> {
        Arc::new_cyclic(|me| IdlingResourceRegistry {
            looper,
            timeout: config.timeout,
            warning_interval: config.warning_interval,
            me: me.clone(),
            state: Mutex::new(State::default()),
        })
    }

    /// The owner looper.
    pub fn looper(&self) -> &Handle {
        &self.looper
    }

    /// Registers a resource. Returns false if it was already registered.
    ///
    /// May be called from any thread. Off the owner thread the registration
    /// is carried out by the owner looper, and this call blocks until it
    /// has been; the looper must be running.
    pub fn register(&self, resource: Arc<dyn IdlingResource>) -> bool {
        let name = resource.name().to_owned();
        match self.on_owner_thread(move |registry| registry.add(resource)) {
            Ok(added) => added,
            Err(e) => {
                warn!("could not register {}: {}", name, e);
                false
            }
        }
    }

    /// Registers each resource. Returns true if all of them were new.
    pub fn register_all<I>(&self, resources: I) -> bool
    where
        I: IntoIterator<Item = Arc<dyn IdlingResource>>,
    {
        resources
            .into_iter()
            .fold(true, |all_new, resource| self.register(resource) && all_new)
    }

    /// Unregisters a resource. Returns false if it was not registered.
    ///
    /// May be called from any thread, like `register`. If this leaves a
    /// pending request with nothing busy, the request settles as idle on the
    /// owner looper's next pass.
    pub fn unregister(&self, resource: &Arc<dyn IdlingResource>) -> bool {
        let resource = resource.clone();
        let name = resource.name().to_owned();
        match self.on_owner_thread(move |registry| registry.remove(&resource)) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("could not unregister {}: {}", name, e);
                false
            }
        }
    }

    /// The number of registered resources.
    ///
    /// Unlike the idleness queries, the bookkeeping accessors may be called
    /// from any thread. Registrations still in flight to the owner thread
    /// are not counted.
    pub fn len(&self) -> usize {
        self.state().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The names of the registered resources, in registration order.
    ///
    /// May be called from any thread, like `len`.
    pub fn names(&self) -> Vec<String> {
        self.state()
            .resources
            .values()
            .map(|e| e.resource.name().to_owned())
            .collect()
    }

    /// Whether a notification request is waiting for idleness. May be called
    /// from any thread.
    pub fn is_pending(&self) -> bool {
        self.state().pending.is_some()
    }

    /// Returns true if every registered resource is idle right now.
    ///
    /// A registry without resources is idle.
    pub fn all_resources_are_idle(&self) -> Result<bool, Error> {
        self.looper.check_owner()?;
        Ok(self.busy_resources().is_empty())
    }

    /// Notifies `callback` once every registered resource is idle.
    ///
    /// If everything is already idle the callback fires before this returns.
    /// Otherwise the callback is warned about the busy resources now and at
    /// every warning interval, until they are all idle or the timeout
    /// elapses.
    ///
    /// Only one request may be pending at a time.
    pub fn notify_when_all_resources_are_idle<C>(&self, callback: C) -> Result<(), Error>
    where
        C: IdleNotificationCallback + 'static,
    {
        self.looper.check_owner()?;
        if self.is_pending() {
            return Err(Error::AlreadyPending);
        }

        let callback: Box<dyn IdleNotificationCallback> = Box::new(callback);
        let callback: SharedCallback = Arc::new(Mutex::new(callback));
        let busy = self.busy_resources();
        if busy.is_empty() {
            trace!("all resources already idle");
            invoke(&callback, "all_resources_idle", |cb| cb.all_resources_idle());
            return Ok(());
        }

        let generation = {
            let mut state = self.state();
            if state.pending.is_some() {
                return Err(Error::AlreadyPending);
            }
            state.generation += 1;
            state.pending = Some(Pending {
                callback,
                generation: state.generation,
                started: self.looper.now(),
                warnings: 0,
                recheck: None,
            });
            state.generation
        };

        self.warn_and_reschedule(generation, busy);
        Ok(())
    }

    /// Returns a future that resolves once every registered resource is idle,
    /// or the timeout has elapsed.
    ///
    /// May be called from any thread. Resolves to `Error::AlreadyPending` if
    /// another request is waiting when the owner thread gets to it.
    pub fn when_idle(&self) -> IdleFuture {
        let (tx, rx) = oneshot::channel();
        let me = self.me.clone();
        self.looper.post(move || {
            let registry = match me.upgrade() {
                Some(registry) => registry,
                None => return,
            };
            if registry.is_pending() {
                let _ = tx.send(Err(Error::AlreadyPending));
                return;
            }
            if let Err(e) = registry.notify_when_all_resources_are_idle(Settle(Some(tx))) {
                error!("could not wait for idle resources: {}", e);
            }
        });
        rx
    }

    /// Logs every resource's last reported state and any pending request.
    pub fn dump_state_to_logs(&self) {
        let state = self.state();
        info!("{} idling resource(s) registered", state.resources.len());
        for entry in state.resources.values() {
            info!(
                "  {}: {}",
                entry.resource.name(),
                if entry.idle { "idle" } else { "busy" }
            );
        }
        if let Some(ref pending) = state.pending {
            info!(
                "waiting {:?} for idleness; {} warning(s) issued",
                self.looper.now().duration_since(pending.started),
                pending.warnings
            );
        }
    }

    fn state(&self) -> MutexGuard<State> {
        self.state.lock().expect("registry state lock")
    }

    /// Runs `f` on the owner thread, waiting for its result.
    fn on_owner_thread<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&IdlingResourceRegistry) -> T + Send + 'static,
    {
        if self.looper.is_owner_thread() {
            return Ok(f(self));
        }

        let (tx, rx) = oneshot::channel();
        let me = self.me.clone();
        self.looper.post(move || {
            if let Some(registry) = me.upgrade() {
                let _ = tx.send(f(&*registry));
            }
        });
        rx.wait().map_err(|oneshot::Canceled| Error::LooperGone)
    }

    fn add(&self, resource: Arc<dyn IdlingResource>) -> bool {
        let key = key_of(&resource);
        {
            let mut state = self.state();
            if state.resources.contains_key(&key) {
                debug!("{} is already registered", resource.name());
                return false;
            }
            if state.resources.values().any(|e| e.resource.name() == resource.name()) {
                warn!(
                    "registering a second resource named {:?}; busy reports will not tell them apart",
                    resource.name()
                );
            }
            state.resources.insert(key, Entry { resource: resource.clone(), idle: false });
        }

        let me = self.me.clone();
        let looper = self.looper.clone();
        resource.register_idle_transition_callback(ResourceCallback::new(move || {
            let me = me.clone();
            looper.post(move || {
                if let Some(registry) = me.upgrade() {
                    registry.on_transition_to_idle(key);
                }
            });
        }));

        debug!("registered {}", resource.name());
        true
    }

    fn remove(&self, resource: &Arc<dyn IdlingResource>) -> bool {
        let key = key_of(resource);
        let (removed, generation) = {
            let mut state = self.state();
            let removed = state.resources.shift_remove(&key).is_some();
            (removed, state.pending.as_ref().map(|p| p.generation))
        };
        if !removed {
            return false;
        }

        debug!("unregistered {}", resource.name());
        if let Some(generation) = generation {
            // The caller may be the pending request's own callback.
            let me = self.me.clone();
            self.looper.post(move || {
                if let Some(registry) = me.upgrade() {
                    registry.settle_if_idle(generation);
                }
            });
        }
        true
    }

    /// Resolves the pending request if none of its resources is busy.
    fn settle_if_idle(&self, generation: u64) {
        match self.state().pending {
            Some(ref p) if p.generation == generation => {}
            _ => return,
        }
        if self.busy_resources().is_empty() {
            self.resolve(generation, Settled::Idle);
        }
    }

    /// Queries every resource and returns the names of those that are busy.
    ///
    /// A resource whose query panics keeps the idleness it last reported.
    fn busy_resources(&self) -> Vec<String> {
        let snapshot = self
            .state()
            .resources
            .iter()
            .map(|(&key, e)| (key, e.resource.clone()))
            .collect::<Vec<_>>();

        let reports = snapshot
            .into_iter()
            .map(|(key, resource)| {
                let report = panic::catch_unwind(AssertUnwindSafe(|| resource.is_idle_now()));
                match report {
                    Ok(idle) => (key, Some(idle)),
                    Err(panic) => {
                        error!(
                            "is_idle_now of {} panicked: {}",
                            resource.name(),
                            panic_message(&panic)
                        );
                        (key, None)
                    }
                }
            })
            .collect::<Vec<_>>();

        let mut state = self.state();
        let mut busy = Vec::new();
        for (key, report) in reports {
            if let Some(entry) = state.resources.get_mut(&key) {
                if let Some(idle) = report {
                    entry.idle = idle;
                }
                if !entry.idle {
                    busy.push(entry.resource.name().to_owned());
                }
            }
        }
        busy
    }

    /// Warns the pending request about `busy` and schedules the next check.
    fn warn_and_reschedule(&self, generation: u64, busy: Vec<String>) {
        let (callback, warnings) = {
            let mut state = self.state();
            let pending = match state.pending {
                Some(ref mut p) if p.generation == generation => p,
                _ => return,
            };
            pending.warnings += 1;

            // The last check lands on the timeout.
            let elapsed = self.looper.now().duration_since(pending.started);
            let remaining = self.timeout.checked_sub(elapsed).unwrap_or_default();
            let delay = cmp::min(self.warning_interval, remaining);

            let me = self.me.clone();
            let token = self.looper.post_delayed(
                move || {
                    if let Some(registry) = me.upgrade() {
                        registry.recheck(generation);
                    }
                },
                delay,
            );
            pending.recheck = Some(token);
            (pending.callback.clone(), pending.warnings)
        };

        warn!("resources still busy (warning {}): {:?}", warnings, busy);
        invoke(&callback, "resources_still_busy_warning", |cb| {
            cb.resources_still_busy_warning(&busy)
        });
    }

    /// The scheduled check of a pending request.
    fn recheck(&self, generation: u64) {
        let started = match self.state().pending {
            Some(ref p) if p.generation == generation => p.started,
            _ => return,
        };

        let busy = self.busy_resources();
        if busy.is_empty() {
            self.resolve(generation, Settled::Idle);
        } else if self.looper.now().duration_since(started) >= self.timeout {
            self.resolve(generation, Settled::TimedOut(busy));
        } else {
            self.warn_and_reschedule(generation, busy);
        }
    }

    /// A resource reported a transition to idle.
    fn on_transition_to_idle(&self, key: usize) {
        let (name, generation) = {
            let state = self.state();
            let name = match state.resources.get(&key) {
                Some(entry) => entry.resource.name().to_owned(),
                None => return,
            };
            (name, state.pending.as_ref().map(|p| p.generation))
        };
        trace!("{} transitioned to idle", name);

        let generation = match generation {
            Some(generation) => generation,
            None => return,
        };

        let busy = self.busy_resources();
        if busy.is_empty() {
            self.resolve(generation, Settled::Idle);
        } else if busy.contains(&name) {
            warn!("{} reported a transition to idle but is busy; possible race", name);
        }
    }

    /// Retires the pending request and notifies its callback.
    fn resolve(&self, generation: u64, settled: Settled) {
        let pending = {
            let mut state = self.state();
            match state.pending {
                Some(ref p) if p.generation == generation => {}
                _ => return,
            }
            state.pending.take()
        };
        let pending = match pending {
            Some(pending) => pending,
            None => return,
        };

        if let Some(token) = pending.recheck {
            self.looper.remove(token);
        }

        match settled {
            Settled::Idle => {
                debug!("all resources idle after {} warning(s)", pending.warnings);
                invoke(&pending.callback, "all_resources_idle", |cb| cb.all_resources_idle());
            }
            Settled::TimedOut(busy) => {
                error!(
                    "timed out after {:?} waiting for busy resources: {:?}",
                    self.timeout, busy
                );
                invoke(&pending.callback, "resources_have_timed_out", |cb| {
                    cb.resources_have_timed_out(&busy)
                });
            }
        }
    }
}

impl fmt::Debug for IdlingResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IdlingResourceRegistry")
            .field("resources", &self.names())
            .field("pending", &self.is_pending())
            .field("timeout", &self.timeout)
            .field("warning_interval", &self.warning_interval)
            .finish()
    }
}

// ===== impl Settle =====

impl Settle {
    fn send(&mut self, settled: Settled) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(Ok(settled));
        }
    }
}

impl IdleNotificationCallback for Settle {
    fn all_resources_idle(&mut self) {
        self.send(Settled::Idle);
    }

    fn resources_still_busy_warning(&mut self, _: &[String]) {}

    fn resources_have_timed_out(&mut self, busy: &[String]) {
        self.send(Settled::TimedOut(busy.to_vec()));
    }
}

// ===== impl Error =====

impl From<looper::WrongThread> for Error {
    fn from(e: looper::WrongThread) -> Self {
        Error::WrongThread(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::WrongThread(ref e) => write!(f, "registry {}", e),
            Error::AlreadyPending => f.pad("an idle notification request is already pending"),
            Error::LooperGone => f.pad("the registry's looper is gone"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::WrongThread(ref e) => Some(e),
            _ => None,
        }
    }
}

// ===== helpers =====

/// Identifies a resource by its allocation.
fn key_of(resource: &Arc<dyn IdlingResource>) -> usize {
    &**resource as *const dyn IdlingResource as *const () as usize
}

/// Calls into a notification callback, logging rather than propagating a
/// panic.
fn invoke<F>(callback: &SharedCallback, method: &str, f: F)
where
    F: FnOnce(&mut Box<dyn IdleNotificationCallback>),
{
    let mut cb = match callback.lock() {
        Ok(cb) => cb,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| f(&mut *cb))) {
        error!("{} panicked: {}", method, panic_message(&panic));
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use idling_resource::{CountingIdlingResource, IdlingResource};
    use super::*;

    #[test]
    fn keys_follow_the_allocation() {
        let a: Arc<dyn IdlingResource> = Arc::new(CountingIdlingResource::new("a"));
        let also_a = a.clone();
        let b: Arc<dyn IdlingResource> = Arc::new(CountingIdlingResource::new("a"));

        assert_eq!(key_of(&a), key_of(&also_a));
        assert_ne!(key_of(&a), key_of(&b));
    }

    #[test]
    fn panic_messages() {
        let s = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&s), "static");

        let owned = panic::catch_unwind(|| panic!("owned {}", 1)).unwrap_err();
        assert_eq!(panic_message(&owned), "owned 1");
    }

    #[test]
    fn settle_sends_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut settle = Settle(Some(tx));

        settle.resources_still_busy_warning(&["a".to_owned()]);
        settle.resources_have_timed_out(&["a".to_owned()]);
        settle.all_resources_idle();

        assert_eq!(
            rx.try_recv(),
            Ok(Some(Ok(Settled::TimedOut(vec!["a".to_owned()]))))
        );
    }

    #[test]
    fn errors_display() {
        assert_eq!(
            Error::AlreadyPending.to_string(),
            "an idle notification request is already pending"
        );
        assert_eq!(Error::LooperGone.to_string(), "the registry's looper is gone");
    }
}
