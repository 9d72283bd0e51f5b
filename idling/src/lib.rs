//! Synchronizes UI tests with the asynchronous work of an application.
//!
//! Work that a test must wait for is modelled as an [`IdlingResource`].
//! Resources are registered with an [`IdlingResourceRegistry`], which lives on
//! the thread that drives the application's event loop (its [`Looper`]) and
//! answers two questions before every UI action or assertion:
//!
//! - are all resources idle right now?
//! - tell me when they all are, warning me while they are not, and giving up
//!   after a timeout.
//!
//! ```no_run
//! extern crate espresso_idling;
//!
//! use espresso_idling::{Config, CountingIdlingResource, IdlingResourceRegistry, Looper};
//! use std::sync::Arc;
//!
//! # fn main() {
//! let looper = Looper::new();
//! let registry = IdlingResourceRegistry::new(looper.handle(), &Config::default());
//!
//! let downloads = Arc::new(CountingIdlingResource::new("downloads"));
//! registry.register(downloads.clone());
//!
//! downloads.increment();
//! // ... start a download on another thread that calls `decrement()` ...
//! # }
//! ```

extern crate env_logger;
extern crate espresso_idling_looper as looper;
extern crate espresso_idling_resource as idling_resource;
extern crate futures;
extern crate indexmap;
#[macro_use]
extern crate log;
extern crate regex;

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod config;
mod drawer;
pub mod logging;
mod registry;

pub use self::config::Config;
pub use self::drawer::{Drawer, DrawerListener, DrawerState, IdlingDrawerListener};
pub use self::registry::{
    Error,
    IdleFuture,
    IdleNotificationCallback,
    IdlingResourceRegistry,
    Settled,
};
pub use idling_resource::{Busy, CallbackSlot, CountingIdlingResource, IdlingResource, ResourceCallback};
pub use looper::{Handle, Looper, ManualClock, Now, Token, WrongThread};
