use std::{fmt, sync::{Arc, Mutex, MutexGuard, Weak, atomic::{AtomicBool, Ordering}}};

use idling_resource::{CallbackSlot, IdlingResource, ResourceCallback};

const NAME: &str = "IdlingDrawerListener";

/// The motion state of a drawer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawerState {
    /// Fully open or fully closed, not moving.
    Idle,
    /// Being dragged by the user.
    Dragging,
    /// Animating towards open or closed.
    Settling,
}

/// Receives a drawer's events. Every method defaults to doing nothing.
pub trait DrawerListener: Send + Sync {
    fn on_drawer_slide(&self, _offset: f32) {}

    fn on_drawer_opened(&self) {}

    fn on_drawer_closed(&self) {}

    fn on_drawer_state_changed(&self, _state: DrawerState) {}

    /// Returns the listener as an `IdlingDrawerListener`, if it is one.
    #[doc(hidden)]
    fn as_idling(&self) -> Option<Arc<IdlingDrawerListener>> {
        None
    }
}

/// A sliding drawer widget, reduced to the events it reports.
///
/// The drawer holds a single listener.
pub struct Drawer {
    listener: Mutex<Option<Arc<dyn DrawerListener>>>,
    state: Mutex<Position>,
}

#[derive(Clone, Copy, Debug)]
struct Position {
    state: DrawerState,
    open: bool,
}

/// Layers the idling-resource contract onto a drawer.
///
/// Events are forwarded, unchanged, to the listener that was installed
/// before it. The resource is idle while the drawer is in
/// `DrawerState::Idle`.
pub struct IdlingDrawerListener {
    parent: Option<Arc<dyn DrawerListener>>,
    idle: AtomicBool,
    callback: CallbackSlot,
    me: Weak<IdlingDrawerListener>,
}

// ===== impl Drawer =====

impl Drawer {
    /// A closed, idle drawer without a listener.
    pub fn new() -> Self {
        Drawer {
            listener: Mutex::new(None),
            state: Mutex::new(Position { state: DrawerState::Idle, open: false }),
        }
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn DrawerListener>>) {
        *self.listener.lock().expect("drawer listener lock") = listener;
    }

    pub fn listener(&self) -> Option<Arc<dyn DrawerListener>> {
        self.listener.lock().expect("drawer listener lock").clone()
    }

    pub fn state(&self) -> DrawerState {
        self.position().state
    }

    pub fn is_open(&self) -> bool {
        self.position().open
    }

    /// Moves to `state`, notifying the listener if it changed.
    pub fn set_state(&self, state: DrawerState) {
        let changed = {
            let mut position = self.position();
            let changed = position.state != state;
            position.state = state;
            changed
        };
        if changed {
            self.dispatch(|l| l.on_drawer_state_changed(state));
        }
    }

    /// Reports the drawer's position, from 0.0 (closed) to 1.0 (open).
    pub fn slide(&self, offset: f32) {
        self.dispatch(|l| l.on_drawer_slide(offset));
    }

    /// Runs the open animation to completion.
    pub fn open(&self) {
        self.settle(true);
    }

    /// Runs the close animation to completion.
    pub fn close(&self) {
        self.settle(false);
    }

    fn settle(&self, open: bool) {
        self.set_state(DrawerState::Settling);
        self.slide(if open { 1.0 } else { 0.0 });
        self.position().open = open;
        if open {
            self.dispatch(|l| l.on_drawer_opened());
        } else {
            self.dispatch(|l| l.on_drawer_closed());
        }
        self.set_state(DrawerState::Idle);
    }

    fn position(&self) -> MutexGuard<Position> {
        self.state.lock().expect("drawer state lock")
    }

    /// Calls the listener outside of the drawer's locks.
    fn dispatch<F: FnOnce(&dyn DrawerListener)>(&self, f: F) {
        if let Some(listener) = self.listener() {
            f(&*listener);
        }
    }
}

impl Default for Drawer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Drawer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let position = self.position();
        f.debug_struct("Drawer")
            .field("state", &position.state)
            .field("open", &position.open)
            .finish()
    }
}

// ===== impl IdlingDrawerListener =====

impl IdlingDrawerListener {
    /// Installs an idling listener on `drawer`, wrapping its current listener.
    ///
    /// If the drawer's listener already is an `IdlingDrawerListener`, that
    /// listener is returned and nothing is re-wrapped.
    pub fn install(drawer: &Drawer) -> Arc<IdlingDrawerListener> {
        let parent = drawer.listener();
        if let Some(existing) = parent.as_ref().and_then(|l| l.as_idling()) {
            debug!("drawer already has an idling listener");
            return existing;
        }

        let idle = drawer.state() == DrawerState::Idle;
        let listener = Arc::new_cyclic(|me| IdlingDrawerListener {
            parent,
            idle: AtomicBool::new(idle),
            callback: CallbackSlot::new(),
            me: me.clone(),
        });
        drawer.set_listener(Some(listener.clone() as Arc<dyn DrawerListener>));
        debug!("installed idling listener on drawer (idle={})", idle);
        listener
    }

    /// The listener whose events are forwarded.
    pub fn parent(&self) -> Option<&Arc<dyn DrawerListener>> {
        self.parent.as_ref()
    }
}

impl DrawerListener for IdlingDrawerListener {
    fn on_drawer_slide(&self, offset: f32) {
        if let Some(ref parent) = self.parent {
            parent.on_drawer_slide(offset);
        }
    }

    fn on_drawer_opened(&self) {
        if let Some(ref parent) = self.parent {
            parent.on_drawer_opened();
        }
    }

    fn on_drawer_closed(&self) {
        if let Some(ref parent) = self.parent {
            parent.on_drawer_closed();
        }
    }

    fn on_drawer_state_changed(&self, state: DrawerState) {
        if let Some(ref parent) = self.parent {
            parent.on_drawer_state_changed(state);
        }

        let idle = state == DrawerState::Idle;
        let was_idle = self.idle.swap(idle, Ordering::AcqRel);
        if idle && !was_idle {
            trace!("drawer settled");
            self.callback.notify();
        }
    }

    fn as_idling(&self) -> Option<Arc<IdlingDrawerListener>> {
        self.me.upgrade()
    }
}

impl IdlingResource for IdlingDrawerListener {
    fn name(&self) -> &str {
        NAME
    }

    fn is_idle_now(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    fn register_idle_transition_callback(&self, callback: ResourceCallback) {
        self.callback.set(callback);
    }
}

impl fmt::Debug for IdlingDrawerListener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct(NAME)
            .field("idle", &self.is_idle_now())
            .field("wrapping", &self.parent.is_some())
            .finish()
    }
}
