//! Cooperative task queues
//!
//! Posting to a [`Handler`] appends a task to its FIFO. The [`Looper`] drains
//! all handlers one task at a time in turn, so tasks posted to the same
//! handler run in order while no ordering is implied between handlers.
//! Time is virtual: delayed tasks only fire when the looper is advanced.

use log::trace;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// A unit of work executed on a handler
pub type Task = Box<dyn FnOnce()>;

/// Identifies a delayed task so it can be cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

struct Timer {
    handler: Weak<HandlerInner>,
    task: Task,
}

struct LooperInner {
    now: Cell<Duration>,
    next_timer_id: Cell<u64>,
    handlers: RefCell<Vec<Weak<HandlerInner>>>,
    timers: RefCell<BTreeMap<(Duration, TimerId), Timer>>,
}

struct HandlerInner {
    name: String,
    tasks: RefCell<VecDeque<Task>>,
    looper: Rc<LooperInner>,
}

/// Drives every handler created from it
#[derive(Clone)]
pub struct Looper {
    inner: Rc<LooperInner>,
}

impl Looper {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(LooperInner {
                now: Cell::new(Duration::ZERO),
                next_timer_id: Cell::new(1),
                handlers: RefCell::new(Vec::new()),
                timers: RefCell::new(BTreeMap::new()),
            }),
        }
    }

    /// Create a new task queue driven by this looper
    pub fn new_handler(&self, name: &str) -> Handler {
        let inner = Rc::new(HandlerInner {
            name: name.to_string(),
            tasks: RefCell::new(VecDeque::new()),
            looper: self.inner.clone(),
        });
        self.inner.handlers.borrow_mut().push(Rc::downgrade(&inner));
        Handler { inner }
    }

    /// Current virtual time
    pub fn now(&self) -> Duration {
        self.inner.now.get()
    }

    /// Number of delayed tasks that have not fired yet
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// Run posted tasks until every handler is empty.
    ///
    /// Handlers are visited in creation order and each gives up at most one
    /// task per pass. Returns the number of tasks executed.
    pub fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        loop {
            let handlers: Vec<Rc<HandlerInner>> = {
                let mut handlers = self.inner.handlers.borrow_mut();
                handlers.retain(|handler| handler.strong_count() > 0);
                handlers.iter().filter_map(Weak::upgrade).collect()
            };

            let mut ran_any = false;
            for handler in &handlers {
                let task = handler.tasks.borrow_mut().pop_front();
                if let Some(task) = task {
                    task();
                    executed += 1;
                    ran_any = true;
                }
            }

            if !ran_any {
                return executed;
            }
        }
    }

    /// Move virtual time forward, firing due timers in deadline order.
    pub fn advance(&self, duration: Duration) -> usize {
        let deadline = self.now() + duration;
        let mut executed = self.run_until_idle();

        loop {
            let due = {
                let mut timers = self.inner.timers.borrow_mut();
                match timers.keys().next().copied() {
                    Some(key) if key.0 <= deadline => timers.remove(&key).map(|timer| (key.0, timer)),
                    _ => None,
                }
            };
            let Some((when, timer)) = due else {
                break;
            };

            self.inner.now.set(when);
            if let Some(handler) = timer.handler.upgrade() {
                trace!("Timer due at {:?} on {}", when, handler.name);
                handler.tasks.borrow_mut().push_back(timer.task);
            }
            executed += self.run_until_idle();
        }

        self.inner.now.set(deadline);
        executed
    }
}

impl Default for Looper {
    fn default() -> Self {
        Self::new()
    }
}

/// A component's FIFO task queue
#[derive(Clone)]
pub struct Handler {
    inner: Rc<HandlerInner>,
}

impl Handler {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Append a task to this handler's queue
    pub fn post<F: FnOnce() + 'static>(&self, task: F) {
        self.inner.tasks.borrow_mut().push_back(Box::new(task));
    }

    /// Post `task` once `delay` of virtual time has elapsed
    pub fn post_delayed<F: FnOnce() + 'static>(&self, delay: Duration, task: F) -> TimerId {
        let looper = &self.inner.looper;
        let id = TimerId(looper.next_timer_id.get());
        looper.next_timer_id.set(id.0 + 1);
        let deadline = looper.now.get() + delay;
        looper.timers.borrow_mut().insert(
            (deadline, id),
            Timer {
                handler: Rc::downgrade(&self.inner),
                task: Box::new(task),
            },
        );
        id
    }

    /// Cancel a delayed task. Returns false if it already fired or was cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let mut timers = self.inner.looper.timers.borrow_mut();
        let key = timers.keys().find(|(_, timer_id)| *timer_id == id).copied();
        match key {
            Some(key) => timers.remove(&key).is_some(),
            None => false,
        }
    }

    /// Tasks posted but not yet executed
    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.borrow().len()
    }

    pub fn ptr_eq(&self, other: &Handler) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.inner.name)
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}
