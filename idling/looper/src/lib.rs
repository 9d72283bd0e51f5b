//! A message queue owned by a single thread.
//!
//! A `Looper` is created on the thread that drives an application's UI
//! events and becomes that thread's queue of pending work. Any thread may
//! post tasks to it through a `Handle`, but tasks only ever run on the owner
//! thread, in deadline order and, among equal deadlines, in the order they
//! were posted.
//!
//! The owner never blocks on a task: waiting is expressed by posting a
//! delayed task and returning to the loop.

#[macro_use]
extern crate log;

use std::{
    cmp,
    collections::BTreeMap,
    error,
    fmt,
    marker::PhantomData,
    mem,
    rc::Rc,
    sync::{Arc, Mutex, MutexGuard, atomic::{AtomicBool, Ordering}},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

mod now;

pub use self::now::{ManualClock, Now};

/// Work posted to a looper.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// The longest a task may be delayed by.
const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// The longest the owner thread parks before re-evaluating its exit condition.
const MAX_PARK: Duration = Duration::from_millis(50);

/// Runs tasks on the thread that created it.
///
/// A `Looper` cannot leave its owner thread; use `handle()` to reach it from
/// elsewhere.
pub struct Looper {
    shared: Arc<Shared>,
    _owned: PhantomData<Rc<()>>,
}

/// A thread-safe reference to a `Looper`.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

/// Identifies a posted task so that it may be removed before it runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Token {
    when: Instant,
    seq: u64,
}

/// Indicates that an owner-only operation was invoked from another thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrongThread {
    pub owner: ThreadId,
    pub current: ThreadId,
}

struct Shared {
    owner: ThreadId,
    thread: thread::Thread,
    now: Box<dyn Now + Send + Sync>,
    closed: AtomicBool,
    queue: Mutex<Queue>,
}

#[derive(Default)]
struct Queue {
    /// Tasks keyed by deadline, then by post order.
    tasks: BTreeMap<(Instant, u64), Task>,
    next_seq: u64,
}

// ===== impl Looper =====

impl Looper {
    /// Creates a looper owned by the current thread, using the system clock.
    pub fn new() -> Self {
        Self::with_clock(())
    }

    /// Creates a looper owned by the current thread with the given time source.
    pub fn with_clock<N: Now + Send + Sync + 'static>(now: N) -> Self {
        let current = thread::current();
        debug!("looper created on {:?}", current.name().unwrap_or("<unnamed>"));
        let shared = Shared {
            owner: current.id(),
            thread: current,
            now: Box::new(now),
            closed: AtomicBool::new(false),
            queue: Mutex::new(Queue::default()),
        };
        Looper {
            shared: Arc::new(shared),
            _owned: PhantomData,
        }
    }

    pub fn handle(&self) -> Handle {
        Handle { shared: self.shared.clone() }
    }

    /// The number of tasks waiting to run.
    pub fn len(&self) -> usize {
        self.shared.queue().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The deadline of the earliest waiting task.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared.queue().tasks.keys().next().map(|&(when, _)| when)
    }

    /// Runs every task that is due, without blocking.
    ///
    /// Only tasks posted before this call are considered, so a task that
    /// re-posts itself runs at most once per call. Returns the number of
    /// tasks run.
    pub fn run_pending(&self) -> usize {
        let now = self.shared.now.now();
        let horizon = self.shared.queue().next_seq;

        let mut ran = 0;
        while let Some(task) = self.shared.pop_due(now, horizon) {
            task();
            ran += 1;
        }

        if ran > 0 {
            trace!("ran {} task(s)", ran);
        }
        ran
    }

    /// Runs tasks until `done` returns true.
    ///
    /// Between deadlines the owner thread parks; posting from any thread
    /// wakes it. `done` is evaluated after every pass.
    pub fn run_until<F: FnMut() -> bool>(&self, mut done: F) {
        loop {
            self.run_pending();
            if done() {
                return;
            }

            let park = match self.next_deadline() {
                Some(when) => {
                    let now = self.shared.now.now();
                    if when <= now {
                        continue;
                    }
                    cmp::min(when - now, MAX_PARK)
                }
                None => MAX_PARK,
            };
            thread::park_timeout(park);
        }
    }
}

impl Default for Looper {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        let dropped = mem::replace(&mut self.shared.queue().tasks, BTreeMap::new());
        if !dropped.is_empty() {
            debug!("looper dropped with {} task(s) waiting", dropped.len());
        }
    }
}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Looper")
            .field("owner", &self.shared.owner)
            .field("tasks", &self.len())
            .finish()
    }
}

// ===== impl Handle =====

impl Handle {
    /// Posts a task to run on the owner thread as soon as possible.
    pub fn post<F>(&self, task: F) -> Token
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_delayed(task, Duration::from_secs(0))
    }

    /// Posts a task to run on the owner thread once `delay` has elapsed.
    ///
    /// If the looper has been dropped the task is dropped without running.
    pub fn post_delayed<F>(&self, task: F, delay: Duration) -> Token
    where
        F: FnOnce() + Send + 'static,
    {
        let now = self.shared.now.now();
        let when = match now.checked_add(delay) {
            Some(when) => when,
            None => {
                warn!("delay {:?} is out of range; clamping to {:?}", delay, MAX_DELAY);
                now.checked_add(cmp::min(delay, MAX_DELAY)).unwrap_or(now)
            }
        };
        let token = {
            let mut queue = self.shared.queue();
            let seq = queue.next_seq;
            queue.next_seq += 1;
            if !self.shared.closed.load(Ordering::Acquire) {
                queue.tasks.insert((when, seq), Box::new(task));
            }
            Token { when, seq }
        };

        trace!("posted task {} with delay {:?}", token.seq, delay);
        self.shared.thread.unpark();
        token
    }

    /// Removes a task that has not yet run.
    ///
    /// Returns false if the task already ran or was removed.
    pub fn remove(&self, token: Token) -> bool {
        let removed = self.shared.queue().tasks.remove(&(token.when, token.seq));
        removed.is_some()
    }

    /// The current time according to the looper's clock.
    pub fn now(&self) -> Instant {
        self.shared.now.now()
    }

    pub fn owner(&self) -> ThreadId {
        self.shared.owner
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    /// Fails unless called from the looper's owner thread.
    pub fn check_owner(&self) -> Result<(), WrongThread> {
        let current = thread::current().id();
        if current == self.shared.owner {
            Ok(())
        } else {
            Err(WrongThread { owner: self.shared.owner, current })
        }
    }

    /// True once the looper has been dropped; posted tasks will never run.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Handle")
            .field("owner", &self.shared.owner)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ===== impl Shared =====

impl Shared {
    fn queue(&self) -> MutexGuard<Queue> {
        self.queue.lock().expect("looper queue lock")
    }

    /// Takes the earliest task due at `now` that was posted before `horizon`.
    fn pop_due(&self, now: Instant, horizon: u64) -> Option<Task> {
        let mut queue = self.queue();
        let key = queue
            .tasks
            .keys()
            .take_while(|&&(when, _)| when <= now)
            .find(|&&(_, seq)| seq < horizon)
            .cloned()?;
        queue.tasks.remove(&key)
    }
}

// ===== impl WrongThread =====

impl fmt::Display for WrongThread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "called from {:?} but the looper is owned by {:?}",
            self.current, self.owner
        )
    }
}

impl error::Error for WrongThread {}
